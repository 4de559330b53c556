//! Diesel row structs and their conversion to domain records.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::configuration::{ConfigRow, Roles};
use crate::schema;
use crate::store::{MissingRecord, PowerRecord, RawPowerRecord};

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::power)]
pub struct PowerRow {
    pub site_id: String,
    pub day: NaiveDate,
    pub ts: DateTime<Utc>,
    pub p_cons: f64,
    pub p_prod: f64,
    pub p_tot: f64,
    pub config_id: DateTime<Utc>,
}

impl PowerRow {
    pub fn new(record: &PowerRecord, config_id: DateTime<Utc>) -> Self {
        PowerRow {
            site_id: record.site_id.clone(),
            day: record.day,
            ts: record.timestamp,
            p_cons: record.p_cons,
            p_prod: record.p_prod,
            p_tot: record.p_tot,
            config_id,
        }
    }

    pub fn into_record(self) -> PowerRecord {
        PowerRecord {
            site_id: self.site_id,
            day: self.day,
            timestamp: self.ts,
            p_cons: self.p_cons,
            p_prod: self.p_prod,
            p_tot: self.p_tot,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::group_power)]
pub struct GroupPowerRow {
    pub group_id: String,
    pub day: NaiveDate,
    pub ts: DateTime<Utc>,
    pub p_cons: f64,
    pub p_prod: f64,
    pub p_tot: f64,
    pub config_id: DateTime<Utc>,
}

impl GroupPowerRow {
    pub fn new(record: &PowerRecord, config_id: DateTime<Utc>) -> Self {
        GroupPowerRow {
            group_id: record.site_id.clone(),
            day: record.day,
            ts: record.timestamp,
            p_cons: record.p_cons,
            p_prod: record.p_prod,
            p_tot: record.p_tot,
            config_id,
        }
    }

    pub fn into_record(self) -> PowerRecord {
        PowerRecord {
            site_id: self.group_id,
            day: self.day,
            timestamp: self.ts,
            p_cons: self.p_cons,
            p_prod: self.p_prod,
            p_tot: self.p_tot,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::raw_power)]
pub struct RawPowerRow {
    pub site_id: String,
    pub sensor_id: String,
    pub day: NaiveDate,
    pub ts: DateTime<Utc>,
    pub power: f64,
    pub config_id: DateTime<Utc>,
}

impl RawPowerRow {
    pub fn new(record: &RawPowerRecord, config_id: DateTime<Utc>) -> Self {
        RawPowerRow {
            site_id: record.site_id.clone(),
            sensor_id: record.sensor_id.clone(),
            day: record.day,
            ts: record.timestamp,
            power: record.power,
            config_id,
        }
    }

    pub fn into_record(self) -> RawPowerRecord {
        RawPowerRecord {
            site_id: self.site_id,
            sensor_id: self.sensor_id,
            day: self.day,
            timestamp: self.ts,
            power: self.power,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::raw_missing)]
pub struct MissingRow {
    pub site_id: String,
    pub sensor_id: String,
    pub day: NaiveDate,
    pub first_missing: DateTime<Utc>,
    pub missing_ticks: i32,
    pub config_id: DateTime<Utc>,
}

impl MissingRow {
    pub fn new(record: &MissingRecord, config_id: DateTime<Utc>) -> Self {
        MissingRow {
            site_id: record.site_id.clone(),
            sensor_id: record.sensor_id.clone(),
            day: record.day,
            first_missing: record.first_missing,
            missing_ticks: record.missing_ticks,
            config_id,
        }
    }

    pub fn into_record(self) -> MissingRecord {
        MissingRecord {
            site_id: self.site_id,
            sensor_id: self.sensor_id,
            day: self.day,
            first_missing: self.first_missing,
            missing_ticks: self.missing_ticks,
        }
    }
}

#[derive(Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::sensors_config)]
pub struct SensorConfigRow {
    pub insertion_time: DateTime<Utc>,
    pub site_id: String,
    pub sensor_id: String,
    pub phase: String,
    pub device_id: String,
    pub token: String,
    pub net: i16,
    pub con: i16,
    pub pro: i16,
}

impl SensorConfigRow {
    pub fn new(insertion_time: DateTime<Utc>, row: &ConfigRow) -> Self {
        SensorConfigRow {
            insertion_time,
            site_id: row.site_id.clone(),
            sensor_id: row.sensor_id.clone(),
            phase: row.phase.clone(),
            device_id: row.device_id.clone(),
            token: row.token.clone(),
            net: row.roles.net,
            con: row.roles.con,
            pro: row.roles.pro,
        }
    }

    pub fn into_parts(self) -> (DateTime<Utc>, ConfigRow) {
        (
            self.insertion_time,
            ConfigRow {
                site_id: self.site_id,
                sensor_id: self.sensor_id,
                phase: self.phase,
                device_id: self.device_id,
                token: self.token,
                roles: Roles::new(self.net, self.con, self.pro),
            },
        )
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::site_groups)]
pub struct SiteGroupRow {
    pub group_id: String,
    pub site_id: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = schema::sync_markers)]
pub struct SyncMarkerRow {
    pub site_id: String,
    pub last_synced_day: NaiveDate,
    pub updated_at: DateTime<Utc>,
}
