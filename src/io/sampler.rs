//! Distance sampler abstraction
//!
//! The timing loop asks for exactly one reading per tick. A sampler must
//! return within a bounded time; a failed read is reported as an invalid
//! reading rather than an error, so the loop keeps its cadence.

use crate::domain::types::Reading;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

#[async_trait]
pub trait DistanceSampler: Send {
    /// Take one reading. Never blocks longer than the sampler's read bound.
    async fn sample(&mut self) -> Reading;

    /// Release the underlying device on shutdown
    async fn release(&mut self) {}

    fn name(&self) -> &'static str;
}

#[async_trait]
impl DistanceSampler for Box<dyn DistanceSampler> {
    async fn sample(&mut self) -> Reading {
        (**self).sample().await
    }

    async fn release(&mut self) {
        (**self).release().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Plays back a fixed sequence of readings
///
/// Once the sequence is exhausted it keeps returning invalid readings spaced
/// one cadence apart, so timestamps stay monotonic.
pub struct ReplaySampler {
    readings: VecDeque<Reading>,
    cadence: Duration,
    last_timestamp: Option<Instant>,
}

impl ReplaySampler {
    pub fn new(readings: Vec<Reading>, cadence: Duration) -> Self {
        Self { readings: readings.into(), cadence, last_timestamp: None }
    }

    /// Build a sequence of valid readings from a distance profile.
    /// `profile` maps elapsed milliseconds to centimeters.
    pub fn from_profile<F>(base: Instant, cadence: Duration, total: Duration, profile: F) -> Self
    where
        F: Fn(u64) -> f64,
    {
        let step_ms = cadence.as_millis().max(1) as u64;
        let total_ms = total.as_millis() as u64;
        let readings = (0..=total_ms / step_ms)
            .map(|i| {
                let ms = i * step_ms;
                Reading::valid(profile(ms), base + Duration::from_millis(ms))
            })
            .collect();
        Self::new(readings, cadence)
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

#[async_trait]
impl DistanceSampler for ReplaySampler {
    async fn sample(&mut self) -> Reading {
        let reading = match self.readings.pop_front() {
            Some(r) => r,
            None => {
                let ts = self.last_timestamp.map(|t| t + self.cadence).unwrap_or_else(Instant::now);
                Reading::invalid(ts)
            }
        };
        self.last_timestamp = Some(reading.timestamp);
        reading
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

/// Background distance with nothing in the gate
const SIM_CLEAR_CM: f64 = 400.0;
/// Distance while a rider is in the gate
const SIM_RIDER_CM: f64 = 40.0;
/// How long a simulated rider occupies the gate
const SIM_PASS: Duration = Duration::from_millis(150);
/// Leading edge flutter as the wheel enters the beam
const SIM_FLUTTER: Duration = Duration::from_millis(40);

/// Synthetic sensor: one rider pass per `lap_interval`
///
/// Each pass starts with a short in/out flutter, which the debounce window
/// must absorb.
pub struct SimulatedSampler {
    lap_interval: Duration,
    started_at: Instant,
    sample_count: u64,
}

impl SimulatedSampler {
    pub fn new(lap_interval: Duration) -> Self {
        info!(lap_interval_s = %lap_interval.as_secs_f64(), "simulated_sensor_enabled");
        Self { lap_interval, started_at: Instant::now(), sample_count: 0 }
    }

    /// Distance at `elapsed` since the simulation started
    fn distance_at(&self, elapsed: Duration, sample_index: u64) -> f64 {
        let interval_ms = self.lap_interval.as_millis().max(1);
        // First pass one interval in, so the operator has time to press start
        if elapsed < self.lap_interval {
            return SIM_CLEAR_CM;
        }
        let phase = Duration::from_millis((elapsed.as_millis() % interval_ms) as u64);
        if phase >= SIM_PASS {
            SIM_CLEAR_CM
        } else if phase < SIM_FLUTTER && sample_index % 2 == 1 {
            SIM_CLEAR_CM
        } else {
            SIM_RIDER_CM
        }
    }
}

#[async_trait]
impl DistanceSampler for SimulatedSampler {
    async fn sample(&mut self) -> Reading {
        let now = Instant::now();
        self.sample_count += 1;
        let distance = self.distance_at(now - self.started_at, self.sample_count);
        Reading::valid(distance, now).with_strength(1000).with_temperature(25.0)
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
