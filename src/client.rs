//! Blocking HTTP client for the Flukso sensor API.
//!
//! - One GET per sensor window: `/sensor/{id}?start=..&end=..` (unix seconds).
//! - Authenticated with the per-sensor token passed through unchanged.
//! - Body is a JSON array of `[timestamp, value]` pairs; `"nan"` or `null` values
//!   mark missing readings.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::models::series::{RawSample, TimeSeries};
use crate::sensor::Sensor;
use crate::source::{FetchError, RawSeriesSource};

pub const DEFAULT_BASE_URL: &str = "https://api.flukso.net";
const API_VERSION: &str = "1.0";

pub struct FluksoClient {
    agent: ureq::Agent,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReadingValue {
    Number(f64),
    Text(String),
    Null,
}

#[derive(Debug, Deserialize)]
struct Reading(i64, ReadingValue);

impl FluksoClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        FluksoClient {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, sensor_id: &str) -> String {
        format!("{}/sensor/{}", self.base_url, sensor_id)
    }
}

impl RawSeriesSource for FluksoClient {
    fn fetch(&self, sensor: &Sensor, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<TimeSeries, FetchError> {
        if since > until {
            return Err(FetchError::InvalidWindow { since, until });
        }

        let mut resp = self
            .agent
            .get(&self.url(&sensor.sensor_id))
            .query("start", since.timestamp().to_string())
            .query("end", until.timestamp().to_string())
            .header("Accept", "application/json")
            .header("X-Version", API_VERSION)
            .header("X-Token", &sensor.token)
            .call()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        parse_readings(&body)
    }
}

/// Decode the sensor body into an irregular series.
pub fn parse_readings(body: &str) -> Result<TimeSeries, FetchError> {
    if body.trim().is_empty() {
        return Ok(TimeSeries::new());
    }

    let de = &mut serde_json::Deserializer::from_str(body);
    let readings: Vec<Reading> =
        serde_path_to_error::deserialize(de).map_err(|e| FetchError::Decode(format!("{} at {}", e.inner(), e.path())))?;

    let mut samples = Vec::with_capacity(readings.len());
    for Reading(ts, value) in readings {
        let timestamp =
            DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| FetchError::Decode(format!("timestamp {ts} out of range")))?;
        let sample = match value {
            ReadingValue::Number(v) => RawSample::new(timestamp, v),
            ReadingValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(v) => RawSample::new(timestamp, v),
                Err(_) => RawSample::missing(timestamp),
            },
            ReadingValue::Null => RawSample::missing(timestamp),
        };
        samples.push(sample);
    }
    Ok(TimeSeries::from_samples(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_numbers_and_nan_markers() {
        let series = parse_readings(r#"[[1672531200, 10.5], [1672531208, "nan"], [1672531216, null], [1672531224, "11"]]"#)
            .unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series.first_timestamp(), Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()));
        let values: Vec<_> = series.samples().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Some(10.5), None, None, Some(11.0)]);
    }

    #[test]
    fn empty_body_is_empty_series() {
        assert!(parse_readings("").unwrap().is_empty());
        assert!(parse_readings("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_body_reports_path() {
        let err = parse_readings(r#"[[1672531200, 1.0], ["x", 2.0]]"#).unwrap_err();
        match err {
            FetchError::Decode(msg) => assert!(msg.contains("[1]"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = FluksoClient::new("https://example.test/", Duration::from_secs(1));
        assert_eq!(client.url("abc"), "https://example.test/sensor/abc");
    }
}
