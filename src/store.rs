//! Persistence contract for computed power rows and sync bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Diesel(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One persisted tick of a home (or group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerRecord {
    pub site_id: String,
    pub day: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub p_cons: f64,
    pub p_prod: f64,
    pub p_tot: f64,
}

/// One persisted tick of a single sensor column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPowerRecord {
    pub site_id: String,
    pub sensor_id: String,
    pub day: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub power: f64,
}

/// Missing ticks of one sensor on one day, captured before coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRecord {
    pub site_id: String,
    pub sensor_id: String,
    pub day: NaiveDate,
    pub first_missing: DateTime<Utc>,
    pub missing_ticks: i32,
}

/// Whether a batch belongs to a physical site or a group of sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordScope {
    Site,
    Group,
}

/// Every row of one `(site, day)`, written or replaced as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDayBatch {
    pub scope: RecordScope,
    pub site_id: String,
    pub day: NaiveDate,
    pub config_id: DateTime<Utc>,
    pub power: Vec<PowerRecord>,
    pub raw: Vec<RawPowerRecord>,
    pub missing: Vec<MissingRecord>,
}

impl SiteDayBatch {
    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }
}

pub trait PowerStore: Sync {
    /// Atomically replaces every row of `(scope, site, day)` with the batch,
    /// per-sensor and missing-tick rows included. Returns the number of power
    /// rows written.
    fn replace_site_day(&self, batch: &SiteDayBatch) -> Result<usize, StoreError>;

    /// Rows of one `(site, day)` ordered by timestamp.
    fn load_site_day(&self, scope: RecordScope, site_id: &str, day: NaiveDate) -> Result<Vec<PowerRecord>, StoreError>;

    fn last_synced_day(&self, site_id: &str) -> Result<Option<NaiveDate>, StoreError>;

    fn set_last_synced_day(&self, site_id: &str, day: NaiveDate) -> Result<(), StoreError>;

    /// Days in `[from, until)` on which `site_id` still has missing ticks.
    fn gap_days(&self, site_id: &str, from: NaiveDate, until: NaiveDate) -> Result<Vec<NaiveDate>, StoreError>;

    /// Days with stored per-sensor power for `site_id`, ascending.
    fn raw_days(&self, site_id: &str) -> Result<Vec<NaiveDate>, StoreError>;

    fn load_raw_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<RawPowerRecord>, StoreError>;

    fn load_missing_day(&self, site_id: &str, day: NaiveDate) -> Result<Vec<MissingRecord>, StoreError>;
}
