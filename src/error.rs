//! Error kinds shared by the resampling, configuration and aggregation core.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// Invalid window or period handed to the resampling stages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignmentError {
    #[error("window start {since} is after window end {until}")]
    InvertedWindow { since: DateTime<Utc>, until: DateTime<Utc> },
    #[error("sampling period must be positive, got {millis}ms")]
    NonPositivePeriod { millis: i64 },
    #[error("sampling period must be a whole number of milliseconds, got {micros}µs")]
    SubMillisecondPeriod { micros: i64 },
    #[error("sampling period mismatch: {left_millis}ms vs {right_millis}ms")]
    PeriodMismatch { left_millis: i64, right_millis: i64 },
    #[error("grids are offset by {offset_millis}ms, not a multiple of the {period_millis}ms period")]
    MisalignedGrids { offset_millis: i64, period_millis: i64 },
    #[error("column length mismatch: expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no configuration has been registered yet")]
    NotFound,
    #[error("configuration {config_id} lists sensor {sensor_id} twice for site {site_id}")]
    Duplicate {
        config_id: DateTime<Utc>,
        site_id: String,
        sensor_id: String,
    },
    #[error("sensor {sensor_id} has {field}={value}; coefficients must be -1, 0 or 1")]
    InvalidCoefficient {
        sensor_id: String,
        field: &'static str,
        value: i16,
    },
    #[error("site {0} is not part of the configuration")]
    UnknownSite(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum HomeError {
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("site {0} has no sensors in the configuration")]
    UnknownSite(String),
}

/// Why one `(site, day)` could not be synced. Isolated to that pair.
#[derive(Debug, Error)]
pub enum SiteDayError {
    #[error(transparent)]
    Home(#[from] HomeError),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("loading stored rows of {site_id} {day} failed: {source}")]
    Load {
        site_id: String,
        day: NaiveDate,
        source: StoreError,
    },
    #[error("persisting {site_id} {day} failed after {attempts} attempts: {last}")]
    Persist {
        site_id: String,
        day: NaiveDate,
        attempts: u32,
        last: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker pool setup failed: {0}")]
    WorkerPool(String),
}
