use std::fmt;

use crate::configuration::ConfigRow;

/// One metering channel bound to a home for a single materialization.
#[derive(Clone, PartialEq, Eq)]
pub struct Sensor {
    pub sensor_id: String,
    pub device_id: String,
    pub token: String,
}

impl Sensor {
    pub fn new(sensor_id: impl Into<String>, device_id: impl Into<String>, token: impl Into<String>) -> Self {
        Sensor {
            sensor_id: sensor_id.into(),
            device_id: device_id.into(),
            token: token.into(),
        }
    }

    pub fn from_row(row: &ConfigRow) -> Self {
        Sensor::new(&row.sensor_id, &row.device_id, &row.token)
    }
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("sensor_id", &self.sensor_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.sensor_id)
    }
}
