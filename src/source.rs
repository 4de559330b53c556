//! Contract for the external metering protocol plus a bounded retry wrapper.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::models::series::TimeSeries;
use crate::sensor::Sensor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("requested window {since} .. {until} is inverted")]
    InvalidWindow { since: DateTime<Utc>, until: DateTime<Utc> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("could not decode samples: {0}")]
    Decode(String),
    #[error("sensor {sensor_id} unavailable after {attempts} attempts: {last}")]
    Unavailable {
        sensor_id: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Transport failures, server errors and throttling are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Http { status, .. } => {
                *status >= 500 || *status == http::StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            _ => false,
        }
    }
}

/// Returns all cumulative-counter samples of one sensor between two instants.
///
/// An empty series is a valid answer. Samples slightly before `since` may be
/// included.
pub trait RawSeriesSource: Sync {
    fn fetch(&self, sensor: &Sensor, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<TimeSeries, FetchError>;
}

/// Capped attempts with a constant delay in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: NonZeroU32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: NonZeroU32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }

    pub fn once() -> Self {
        RetryPolicy {
            attempts: NonZeroU32::MIN,
            delay: Duration::ZERO,
        }
    }
}

pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: RawSeriesSource> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Retrying { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: RawSeriesSource> RawSeriesSource for Retrying<S> {
    fn fetch(&self, sensor: &Sensor, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<TimeSeries, FetchError> {
        if since > until {
            return Err(FetchError::InvalidWindow { since, until });
        }

        let attempts = self.policy.attempts.get();
        let mut attempt = 1;
        loop {
            match self.inner.fetch(sensor, since, until) {
                Ok(series) => {
                    debug!("Source: {} returned {} samples", sensor, series.len());
                    return Ok(series);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Source: fetch for {} failed (attempt {}/{}): {}; retrying in {:?}",
                        sensor, attempt, attempts, e, self.policy.delay
                    );
                    attempt += 1;
                    if !self.policy.delay.is_zero() {
                        thread::sleep(self.policy.delay);
                    }
                }
                Err(e) => {
                    return Err(FetchError::Unavailable {
                        sensor_id: sensor.sensor_id.clone(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}
