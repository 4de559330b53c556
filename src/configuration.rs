//! Versioned sensor-to-site configuration.
//!
//! A `Configuration` is an immutable snapshot keyed by its insertion instant
//! (`config_id`). Registering new rows always creates a new version.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ConfigurationError;
use crate::store::StoreError;

/// Signed weights of one sensor towards total, consumption and production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roles {
    #[serde(default)]
    pub net: i16,
    #[serde(default)]
    pub con: i16,
    #[serde(default)]
    pub pro: i16,
}

impl Roles {
    pub fn new(net: i16, con: i16, pro: i16) -> Self {
        Roles { net, con, pro }
    }

    pub fn inverted(self) -> Self {
        Roles {
            net: -self.net,
            con: -self.con,
            pro: -self.pro,
        }
    }

    fn validate(&self, sensor_id: &str) -> Result<(), ConfigurationError> {
        for (field, value) in [("net", self.net), ("con", self.con), ("pro", self.pro)] {
            if !(-1..=1).contains(&value) {
                return Err(ConfigurationError::InvalidCoefficient {
                    sensor_id: sensor_id.to_string(),
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// One `(site, sensor)` assignment inside a configuration version.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub site_id: String,
    pub sensor_id: String,
    #[serde(default)]
    pub phase: String,
    pub device_id: String,
    pub token: String,
    #[serde(flatten)]
    pub roles: Roles,
}

// Tokens are credentials; keep them out of debug output.
impl fmt::Debug for ConfigRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigRow")
            .field("site_id", &self.site_id)
            .field("sensor_id", &self.sensor_id)
            .field("phase", &self.phase)
            .field("device_id", &self.device_id)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

/// Named set of sites whose results are merged into one virtual home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteGroup {
    pub group_id: String,
    pub site_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    config_id: DateTime<Utc>,
    rows: Vec<ConfigRow>,
}

impl Configuration {
    /// Validates coefficients and `(site_id, sensor_id)` uniqueness.
    pub fn new(config_id: DateTime<Utc>, rows: Vec<ConfigRow>) -> Result<Self, ConfigurationError> {
        let mut seen = BTreeSet::new();
        for row in &rows {
            row.roles.validate(&row.sensor_id)?;
            if !seen.insert((row.site_id.as_str(), row.sensor_id.as_str())) {
                return Err(ConfigurationError::Duplicate {
                    config_id,
                    site_id: row.site_id.clone(),
                    sensor_id: row.sensor_id.clone(),
                });
            }
        }
        Ok(Configuration { config_id, rows })
    }

    pub fn config_id(&self) -> DateTime<Utc> {
        self.config_id
    }

    pub fn rows(&self) -> &[ConfigRow] {
        &self.rows
    }

    pub fn site_ids(&self) -> Vec<&str> {
        let ids: BTreeSet<&str> = self.rows.iter().map(|r| r.site_id.as_str()).collect();
        ids.into_iter().collect()
    }

    pub fn site_rows(&self, site_id: &str) -> Vec<&ConfigRow> {
        self.rows.iter().filter(|r| r.site_id == site_id).collect()
    }

    /// Rows of `site_id` with the listed phases flipped: every coefficient is
    /// negated and the phase label toggles its trailing `-`.
    pub fn with_inverted_phases(&self, site_id: &str, phases: &[&str]) -> Result<Vec<ConfigRow>, ConfigurationError> {
        if self.site_rows(site_id).is_empty() {
            return Err(ConfigurationError::UnknownSite(site_id.to_string()));
        }
        let mut rows = self.rows.clone();
        for row in rows.iter_mut().filter(|r| r.site_id == site_id) {
            let base = row.phase.strip_suffix('-').unwrap_or(&row.phase);
            if !phases.contains(&base) && !phases.contains(&row.phase.as_str()) {
                continue;
            }
            row.phase = match row.phase.strip_suffix('-') {
                Some(stripped) => stripped.to_string(),
                None => format!("{}-", row.phase),
            };
            row.roles = row.roles.inverted();
        }
        Ok(rows)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let devices: BTreeSet<&str> = self.rows.iter().map(|r| r.device_id.as_str()).collect();
        write!(
            f,
            "config {} (homes={}, devices={}, sensors={})",
            self.config_id.to_rfc3339(),
            self.site_ids().len(),
            devices.len(),
            self.rows.len()
        )
    }
}

/// Storage contract behind the registry.
pub trait ConfigStore {
    /// Every stored row with its insertion instant.
    fn load_config_rows(&self) -> Result<Vec<(DateTime<Utc>, ConfigRow)>, StoreError>;
    /// Per `(site_id, sensor_id)`, the maximum insertion instant.
    fn latest_insertion_times(&self) -> Result<Vec<(String, String, DateTime<Utc>)>, StoreError>;
    fn load_config_version(&self, config_id: DateTime<Utc>) -> Result<Vec<ConfigRow>, StoreError>;
    fn insert_config_rows(&self, config_id: DateTime<Utc>, rows: &[ConfigRow]) -> Result<(), StoreError>;
    fn load_site_groups(&self) -> Result<Vec<SiteGroup>, StoreError>;
}

pub struct ConfigurationRegistry<'a, S: ConfigStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ConfigStore + ?Sized> ConfigurationRegistry<'a, S> {
    pub fn new(store: &'a S) -> Self {
        ConfigurationRegistry { store }
    }

    pub fn latest(&self) -> Result<Configuration, ConfigurationError> {
        let newest = self
            .store
            .latest_insertion_times()?
            .into_iter()
            .map(|(_, _, inserted)| inserted)
            .max()
            .ok_or(ConfigurationError::NotFound)?;
        let rows = self.store.load_config_version(newest)?;
        Configuration::new(newest, rows)
    }

    /// Rows of `site_id` in the latest configuration.
    pub fn as_of(&self, site_id: &str) -> Result<Vec<ConfigRow>, ConfigurationError> {
        let latest = self.latest()?;
        Ok(latest.site_rows(site_id).into_iter().cloned().collect())
    }

    /// Newest version registered at or before `instant`.
    pub fn version_at(&self, instant: DateTime<Utc>) -> Result<Configuration, ConfigurationError> {
        self.all_versions()?
            .into_iter()
            .rev()
            .find(|c| c.config_id() <= instant)
            .ok_or(ConfigurationError::NotFound)
    }

    /// Oldest first.
    pub fn all_versions(&self) -> Result<Vec<Configuration>, ConfigurationError> {
        let mut by_id: BTreeMap<DateTime<Utc>, Vec<ConfigRow>> = BTreeMap::new();
        for (config_id, row) in self.store.load_config_rows()? {
            by_id.entry(config_id).or_default().push(row);
        }
        by_id
            .into_iter()
            .map(|(config_id, rows)| Configuration::new(config_id, rows))
            .collect()
    }

    /// Earliest instant any version referenced each site.
    pub fn first_seen(&self) -> Result<BTreeMap<String, DateTime<Utc>>, ConfigurationError> {
        let mut first: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for (config_id, row) in self.store.load_config_rows()? {
            first
                .entry(row.site_id)
                .and_modify(|t| *t = (*t).min(config_id))
                .or_insert(config_id);
        }
        Ok(first)
    }

    /// Stores `rows` as a new version stamped with the current instant.
    pub fn register(&self, rows: Vec<ConfigRow>) -> Result<Configuration, ConfigurationError> {
        // microsecond precision survives a timestamptz round trip
        let mut config_id = Utc::now().trunc_subsecs(6);
        if let Some(newest) = self
            .store
            .latest_insertion_times()?
            .into_iter()
            .map(|(_, _, inserted)| inserted)
            .max()
            && config_id <= newest
        {
            config_id = newest + TimeDelta::microseconds(1);
        }

        let configuration = Configuration::new(config_id, rows)?;
        self.store.insert_config_rows(config_id, configuration.rows())?;
        Ok(configuration)
    }

    pub fn groups(&self) -> Result<Vec<SiteGroup>, ConfigurationError> {
        Ok(self.store.load_site_groups()?)
    }
}
