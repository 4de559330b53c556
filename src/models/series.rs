//! Time series shapes used through the pipeline.
//!
//! - `TimeSeries`: irregular samples as delivered by the raw source.
//! - `Grid`: a fixed-period, gap-free sequence of ticks over `[since, until)`.
//! - `UniformSeries`: one optional value per grid tick; `None` marks missing data.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AlignmentError;

/// One counter reading. `value` is `None` when the source reported no number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

impl RawSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        RawSample {
            timestamp,
            value: value.is_finite().then_some(value),
        }
    }

    pub fn missing(timestamp: DateTime<Utc>) -> Self {
        RawSample { timestamp, value: None }
    }
}

/// Irregular series with strictly increasing timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    samples: Vec<RawSample>,
}

impl TimeSeries {
    pub fn new() -> Self {
        TimeSeries::default()
    }

    /// Sorts by timestamp; when two samples share a timestamp the later one wins.
    pub fn from_samples(mut samples: Vec<RawSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        let mut out: Vec<RawSample> = Vec::with_capacity(samples.len());
        for sample in samples {
            match out.last_mut() {
                Some(last) if last.timestamp == sample.timestamp => *last = sample,
                _ => out.push(sample),
            }
        }
        TimeSeries { samples: out }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }
}

/// Uniform tick layout for a half-open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    period: TimeDelta,
}

/// Tick arithmetic runs in whole milliseconds, so the period must be one.
pub(crate) fn check_period(period: TimeDelta) -> Result<(), AlignmentError> {
    if period <= TimeDelta::zero() {
        return Err(AlignmentError::NonPositivePeriod {
            millis: period.num_milliseconds(),
        });
    }
    if period != TimeDelta::milliseconds(period.num_milliseconds()) {
        return Err(AlignmentError::SubMillisecondPeriod {
            micros: period.num_microseconds().unwrap_or(i64::MAX),
        });
    }
    Ok(())
}

// Whole milliseconds, rounded up.
fn ceil_millis(delta: TimeDelta) -> i64 {
    let millis = delta.num_milliseconds();
    if delta > TimeDelta::milliseconds(millis) { millis + 1 } else { millis }
}

impl Grid {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>, period: TimeDelta) -> Result<Self, AlignmentError> {
        check_period(period)?;
        if since > until {
            return Err(AlignmentError::InvertedWindow { since, until });
        }
        Ok(Grid { since, until, period })
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    pub fn period(&self) -> TimeDelta {
        self.period
    }

    /// `ceil((until - since) / period)`
    pub fn len(&self) -> usize {
        let span = ceil_millis(self.until - self.since);
        let step = self.period.num_milliseconds();
        if span <= 0 {
            return 0;
        }
        ((span + step - 1) / step) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamp(&self, index: usize) -> DateTime<Utc> {
        self.since + TimeDelta::milliseconds(self.period.num_milliseconds() * index as i64)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.len()).map(|i| self.timestamp(i))
    }

    /// Index of the bucket `[tick, tick + period)` containing `ts`, if inside the window.
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        if ts < self.since || ts >= self.until {
            return None;
        }
        let offset = (ts - self.since).num_milliseconds();
        let index = (offset / self.period.num_milliseconds()) as usize;
        (index < self.len()).then_some(index)
    }

    pub fn ensure_same_period(&self, other: &Grid) -> Result<(), AlignmentError> {
        if self.period != other.period {
            return Err(AlignmentError::PeriodMismatch {
                left_millis: self.period.num_milliseconds(),
                right_millis: other.period.num_milliseconds(),
            });
        }
        Ok(())
    }

    /// Same period, and ticks of both grids fall on one common lattice.
    pub fn ensure_aligned(&self, other: &Grid) -> Result<(), AlignmentError> {
        self.ensure_same_period(other)?;
        let offset = other.since - self.since;
        let period_millis = self.period.num_milliseconds();
        if offset != TimeDelta::milliseconds(offset.num_milliseconds()) || offset.num_milliseconds() % period_millis != 0 {
            return Err(AlignmentError::MisalignedGrids {
                offset_millis: offset.num_milliseconds(),
                period_millis,
            });
        }
        Ok(())
    }
}

/// One optional value per tick of `grid`.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformSeries {
    grid: Grid,
    values: Vec<Option<f64>>,
}

impl UniformSeries {
    pub fn missing(grid: Grid) -> Self {
        UniformSeries {
            grid,
            values: vec![None; grid.len()],
        }
    }

    pub(crate) fn from_parts(grid: Grid, values: Vec<Option<f64>>) -> Self {
        debug_assert_eq!(grid.len(), values.len());
        UniformSeries { grid, values }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, Option<f64>)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (self.grid.timestamp(i), *v))
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Missing ticks become `0.0`.
    pub fn coerced(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(0.0)).collect()
    }

    pub fn to_series(&self) -> TimeSeries {
        TimeSeries {
            samples: self
                .iter()
                .map(|(timestamp, value)| RawSample { timestamp, value })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs as i64)
    }

    #[test]
    fn grid_counts_partial_last_tick() {
        let grid = Grid::new(at(0), at(20), TimeDelta::seconds(8)).unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.timestamps().collect::<Vec<_>>(), vec![at(0), at(8), at(16)]);
        assert_eq!(grid.bucket_of(at(19)), Some(2));
        assert_eq!(grid.bucket_of(at(20)), None);
    }

    #[test]
    fn grid_rejects_inverted_window_and_bad_period() {
        assert!(matches!(
            Grid::new(at(10), at(0), TimeDelta::seconds(8)),
            Err(AlignmentError::InvertedWindow { .. })
        ));
        assert!(matches!(
            Grid::new(at(0), at(10), TimeDelta::zero()),
            Err(AlignmentError::NonPositivePeriod { millis: 0 })
        ));
    }

    #[test]
    fn sub_millisecond_periods_are_rejected() {
        assert_eq!(
            Grid::new(at(0), at(1), TimeDelta::microseconds(500)),
            Err(AlignmentError::SubMillisecondPeriod { micros: 500 })
        );
        assert!(matches!(
            Grid::new(at(0), at(10), TimeDelta::microseconds(8_000_250)),
            Err(AlignmentError::SubMillisecondPeriod { .. })
        ));
        assert_eq!(Grid::new(at(0), at(1), TimeDelta::milliseconds(250)).unwrap().len(), 4);
    }

    #[test]
    fn fractional_span_counts_the_last_tick() {
        let until = at(8) + TimeDelta::microseconds(500);
        let grid = Grid::new(at(0), until, TimeDelta::seconds(8)).unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.bucket_of(at(8)), Some(1));
    }

    #[test]
    fn offset_grids_are_not_aligned() {
        let day = Grid::new(at(0), at(80), TimeDelta::seconds(8)).unwrap();
        let later = Grid::new(at(40), at(120), TimeDelta::seconds(8)).unwrap();
        let shifted = Grid::new(at(4), at(84), TimeDelta::seconds(8)).unwrap();
        assert!(day.ensure_aligned(&later).is_ok());
        assert_eq!(
            day.ensure_aligned(&shifted),
            Err(AlignmentError::MisalignedGrids {
                offset_millis: 4_000,
                period_millis: 8_000
            })
        );
    }

    #[test]
    fn empty_window_is_valid() {
        let grid = Grid::new(at(5), at(5), TimeDelta::seconds(8)).unwrap();
        assert!(grid.is_empty());
        assert_eq!(grid.bucket_of(at(5)), None);
    }

    #[test]
    fn from_samples_orders_and_dedups() {
        let series = TimeSeries::from_samples(vec![
            RawSample::new(at(4), 2.0),
            RawSample::new(at(1), 1.0),
            RawSample::new(at(4), 3.0),
            RawSample::new(at(2), f64::NAN),
        ]);
        assert_eq!(series.len(), 3);
        assert_eq!(series.first_timestamp(), Some(at(1)));
        assert_eq!(series.samples()[1].value, None);
        assert_eq!(series.samples()[2].value, Some(3.0));
    }
}
