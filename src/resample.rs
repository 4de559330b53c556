//! Bucket-mean resampling onto a grid anchored at the window start.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AlignmentError;
use crate::models::series::{Grid, TimeSeries, UniformSeries};

/// Average every sample into its `[tick, tick + period)` bucket.
///
/// Bucket edges depend only on `grid.since()`. Samples outside the window
/// (the source may include a few before `since`) are ignored, missing samples
/// do not contribute to the mean, and buckets without any sample stay `None`.
pub fn resample(series: &TimeSeries, grid: &Grid) -> UniformSeries {
    let n = grid.len();
    let mut sums = vec![0.0_f64; n];
    let mut counts = vec![0u32; n];

    for sample in series.samples() {
        let Some(value) = sample.value else { continue };
        if let Some(bucket) = grid.bucket_of(sample.timestamp) {
            sums[bucket] += value;
            counts[bucket] += 1;
        }
    }

    let values = sums
        .into_iter()
        .zip(counts)
        .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
        .collect();
    UniformSeries::from_parts(*grid, values)
}

/// Convenience wrapper validating the window before resampling.
pub fn resample_window(
    series: &TimeSeries,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    period: TimeDelta,
) -> Result<UniformSeries, AlignmentError> {
    let grid = Grid::new(since, until, period)?;
    Ok(resample(series, &grid))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::models::series::RawSample;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn to_series(offsets: &[i64]) -> TimeSeries {
        TimeSeries::from_samples(
            offsets
                .iter()
                .map(|&ms| RawSample::new(base() + TimeDelta::milliseconds(ms), ms as f64))
                .collect(),
        )
    }

    proptest! {
        #[test]
        fn output_length_is_tick_count(
            span_ms in 0i64..500_000,
            period_ms in 1i64..60_000,
            offsets in prop::collection::vec(-10_000i64..600_000, 0..200),
        ) {
            let since = base();
            let until = since + TimeDelta::milliseconds(span_ms);
            let out = resample_window(&to_series(&offsets), since, until, TimeDelta::milliseconds(period_ms)).unwrap();
            let expected = (span_ms + period_ms - 1) / period_ms;
            prop_assert_eq!(out.len() as i64, expected);
        }

        #[test]
        fn grid_does_not_depend_on_input(
            left in prop::collection::vec(0i64..120_000, 0..50),
            right in prop::collection::vec(0i64..120_000, 0..50),
        ) {
            let since = base();
            let until = since + TimeDelta::seconds(120);
            let period = TimeDelta::seconds(8);
            let a = resample_window(&to_series(&left), since, until, period).unwrap();
            let b = resample_window(&to_series(&right), since, until, period).unwrap();
            let ticks_a: Vec<_> = a.iter().map(|(ts, _)| ts).collect();
            let ticks_b: Vec<_> = b.iter().map(|(ts, _)| ts).collect();
            prop_assert_eq!(ticks_a, ticks_b);
        }
    }
}
