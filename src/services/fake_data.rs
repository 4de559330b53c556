//! Deterministic synthetic counters for local runs without a metering backend.
//!
//! Each sensor draws a load profile from an rng seeded by its id: a daily
//! sinusoid `base + swing·sin(2πt/day)` in watts, integrated in closed form so
//! any window can be generated independently. Counters are scaled so that one
//! step's delta times `unit_scale` reads back as the mean wattage of that step.
//! Samples sit on epoch-aligned steps and start one step before the requested
//! window. Whole hours drop out at random to exercise gap handling.

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use crate::models::series::{RawSample, TimeSeries};
use crate::sensor::Sensor;
use crate::source::{FetchError, RawSeriesSource};

const DAY_SECS: f64 = 86_400.0;
pub const DEFAULT_OUTAGE_PROBABILITY: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Profile {
    base_w: f64,
    swing_w: f64,
    phase: f64,
    offset: f64,
}

impl Profile {
    fn for_seed(seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let base_w = rng.random_range(150.0..900.0);
        Profile {
            base_w,
            swing_w: base_w * rng.random_range(0.1..0.9),
            phase: rng.random_range(0.0..1.0),
            offset: rng.random_range(0.0..50_000.0),
        }
    }

    /// Joules consumed after `t` seconds since the epoch.
    fn joules(&self, t: f64) -> f64 {
        let shift = self.phase * DAY_SECS;
        let swing = self.swing_w * DAY_SECS / (2.0 * PI);
        self.base_w * t - swing * (2.0 * PI * (t + shift) / DAY_SECS).cos() + swing
    }
}

pub struct FakeSource {
    step: TimeDelta,
    unit_scale: f64,
    outage_probability: f64,
}

// FNV-1a, stable across runs and platforms.
fn sensor_seed(sensor_id: &str) -> u64 {
    sensor_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, b| (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3))
}

impl FakeSource {
    pub fn new(step: TimeDelta, unit_scale: f64, outage_probability: f64) -> Self {
        FakeSource {
            step,
            unit_scale,
            outage_probability: outage_probability.clamp(0.0, 1.0),
        }
    }

    fn hour_is_out(&self, seed: u64, hour: i64) -> bool {
        if self.outage_probability <= 0.0 {
            return false;
        }
        let mut rng = SmallRng::seed_from_u64(seed ^ (hour as u64).rotate_left(17));
        rng.random_bool(self.outage_probability)
    }
}

impl RawSeriesSource for FakeSource {
    fn fetch(&self, sensor: &Sensor, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<TimeSeries, FetchError> {
        if since > until {
            return Err(FetchError::InvalidWindow { since, until });
        }
        let step = self.step.num_seconds().max(1);
        let seed = sensor_seed(&sensor.sensor_id);
        let profile = Profile::for_seed(seed);

        let first = since.timestamp().div_euclid(step) * step - step;
        let end = until.timestamp();
        let counter = |t: f64| profile.offset + profile.joules(t) / (self.unit_scale * step as f64);
        let mut samples = Vec::with_capacity(((end - first) / step).max(0) as usize + 1);
        let mut ts = first;
        while ts < end {
            if !self.hour_is_out(seed, ts.div_euclid(3600))
                && let Some(timestamp) = DateTime::<Utc>::from_timestamp(ts, 0)
            {
                samples.push(RawSample::new(timestamp, counter(ts as f64)));
            }
            ts += step;
        }
        Ok(TimeSeries::from_samples(samples))
    }
}
