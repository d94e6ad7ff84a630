//! Gate crossing detection
//!
//! Turns the raw reading stream into debounced crossing events:
//! - a crossing fires when the latest valid distance drops below the
//!   threshold (object enters the detection zone)
//! - the zone is only left once the distance is back at or above
//!   `threshold + hysteresis`
//! - no two crossings are emitted within the debounce window
//! - invalid readings carry no information and leave the zone state alone
//!
//! Sensor health is tracked on the side: no valid reading for longer than the
//! sensor timeout degrades health, the next valid reading restores it.

use crate::domain::types::{CrossingEvent, Reading, SensorHealth};
use crate::infra::config::TimingParams;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Result of feeding one reading to the detector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Detection {
    pub crossing: Option<CrossingEvent>,
    /// An entry into the zone was suppressed by the debounce window
    pub debounced: bool,
    /// Sensor health changed with this reading
    pub health_changed: Option<SensorHealth>,
}

pub struct CrossingDetector {
    threshold_cm: f64,
    hysteresis_cm: f64,
    debounce: Duration,
    sensor_timeout: Duration,
    below_threshold: bool,
    last_crossing: Option<Instant>,
    last_valid_at: Option<Instant>,
    /// First reading of any kind, used as the health baseline before the
    /// first valid reading arrives
    first_seen_at: Option<Instant>,
    health: SensorHealth,
    last_valid: Option<Reading>,
    invalid_streak: u32,
}

impl CrossingDetector {
    pub fn new(params: &TimingParams) -> Self {
        Self {
            threshold_cm: params.crossing_threshold_cm,
            hysteresis_cm: params.hysteresis_cm,
            debounce: params.debounce,
            sensor_timeout: params.sensor_timeout,
            below_threshold: false,
            last_crossing: None,
            last_valid_at: None,
            first_seen_at: None,
            health: SensorHealth::Unknown,
            last_valid: None,
            invalid_streak: 0,
        }
    }

    /// Feed one reading. Never fails; bad input only affects health.
    pub fn process(&mut self, reading: &Reading) -> Detection {
        let ts = reading.timestamp;
        self.first_seen_at.get_or_insert(ts);

        if !reading.valid {
            return self.process_invalid(ts);
        }

        let mut detection = Detection::default();

        self.invalid_streak = 0;
        self.last_valid_at = Some(ts);
        self.last_valid = Some(*reading);
        if self.health != SensorHealth::Healthy {
            self.health = SensorHealth::Healthy;
            detection.health_changed = Some(SensorHealth::Healthy);
        }

        let distance = reading.distance_cm;
        if !self.below_threshold && distance < self.threshold_cm {
            self.below_threshold = true;

            let debounced = self
                .last_crossing
                .is_some_and(|last| ts.saturating_duration_since(last) < self.debounce);

            if debounced {
                debug!(distance_cm = %distance, "crossing_debounced");
                detection.debounced = true;
            } else {
                self.last_crossing = Some(ts);
                trace!(distance_cm = %distance, "crossing_detected");
                detection.crossing = Some(CrossingEvent { timestamp: ts });
            }
        } else if self.below_threshold && distance >= self.threshold_cm + self.hysteresis_cm {
            self.below_threshold = false;
        }

        detection
    }

    fn process_invalid(&mut self, ts: Instant) -> Detection {
        self.invalid_streak = self.invalid_streak.saturating_add(1);

        let mut detection = Detection::default();
        let reference = self.last_valid_at.or(self.first_seen_at).unwrap_or(ts);
        let silent_for = ts.saturating_duration_since(reference);

        if silent_for > self.sensor_timeout && self.health != SensorHealth::Degraded {
            self.health = SensorHealth::Degraded;
            detection.health_changed = Some(SensorHealth::Degraded);
        }
        detection
    }

    #[inline]
    pub fn health(&self) -> SensorHealth {
        self.health
    }

    /// Latest valid reading
    #[inline]
    pub fn last_valid(&self) -> Option<Reading> {
        self.last_valid
    }

    /// Consecutive invalid readings since the last valid one
    #[inline]
    pub fn invalid_streak(&self) -> u32 {
        self.invalid_streak
    }
}
