//! Cumulative energy counters to instantaneous power on the sampling grid.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AlignmentError;
use crate::models::series::{Grid, TimeSeries, UniformSeries, check_period};
use crate::resample::resample;

/// Counter deltas are multiplied by this to obtain watts (kWh counters).
pub const DEFAULT_UNIT_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerConverter {
    period: TimeDelta,
    unit_scale: f64,
}

impl PowerConverter {
    pub fn new(period: TimeDelta, unit_scale: f64) -> Result<Self, AlignmentError> {
        check_period(period)?;
        Ok(PowerConverter { period, unit_scale })
    }

    pub fn period(&self) -> TimeDelta {
        self.period
    }

    pub fn unit_scale(&self) -> f64 {
        self.unit_scale
    }

    pub fn grid(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Grid, AlignmentError> {
        Grid::new(since, until, self.period)
    }

    /// resample -> diff -> rescale -> resample onto the configured period.
    pub fn to_power(&self, energy: &TimeSeries, grid: &Grid) -> Result<UniformSeries, AlignmentError> {
        let expected = self.grid(grid.since(), grid.until())?;
        expected.ensure_same_period(grid)?;

        let counters = resample(energy, grid);
        let power = self.differentiate(&counters);
        Ok(resample(&power.to_series(), &expected))
    }

    /// Backward difference between consecutive ticks, scaled.
    ///
    /// The first tick has nothing to diff against and reads `0.0` when present;
    /// any tick where either side is missing stays missing.
    pub fn differentiate(&self, counters: &UniformSeries) -> UniformSeries {
        let values = counters.values();
        let mut out = Vec::with_capacity(values.len());
        for (i, current) in values.iter().enumerate() {
            let value = match (i.checked_sub(1).map(|p| values[p]), current) {
                (None, Some(_)) => Some(0.0),
                (Some(Some(prev)), Some(cur)) => Some((cur - prev) * self.unit_scale),
                _ => None,
            };
            out.push(value);
        }
        UniformSeries::from_parts(*counters.grid(), out)
    }
}
