//! Synchronous per-tick processing
//!
//! `TimingEngine` composes the crossing detector and the race state machine
//! and applies the cross-cutting tick rules:
//! - a reading older than the previous one is a clock anomaly and the tick's
//!   sensor processing is skipped
//! - deadlines (DNF, re-arm) are evaluated before the tick's crossing
//! - time-based transitions are frozen while the sensor is degraded
//!
//! The async timing loop drives this; tests drive it directly with synthetic
//! instants.

use crate::domain::race::{RaceEvent, RaceState};
use crate::domain::types::{RaceCommand, Reading, SensorHealth};
use crate::domain::LapHistory;
use crate::infra::config::TimingParams;
use crate::infra::metrics::Metrics;
use crate::services::detector::CrossingDetector;
use crate::services::race_machine::{
    CommandOutcome, CrossingOutcome, RaceEvents, RaceStateMachine,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// What one tick produced
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: RaceEvents,
    /// Reading was discarded as a clock anomaly
    pub discarded: bool,
}

pub struct TimingEngine {
    detector: CrossingDetector,
    machine: RaceStateMachine,
    last_timestamp: Option<Instant>,
    last_reading: Option<Reading>,
    metrics: Arc<Metrics>,
}

impl TimingEngine {
    pub fn new(params: &TimingParams, metrics: Arc<Metrics>) -> Self {
        metrics.set_race_state(RaceState::Idle.tag());
        metrics.set_sensor_health(SensorHealth::Unknown);
        Self {
            detector: CrossingDetector::new(params),
            machine: RaceStateMachine::new(params),
            last_timestamp: None,
            last_reading: None,
            metrics,
        }
    }

    /// Apply an operator command at `now`
    pub fn apply_command(&mut self, command: RaceCommand, now: Instant) -> RaceEvents {
        self.metrics.record_command();
        let (outcome, events) = self.machine.handle_command(command, now, self.detector.health());
        if outcome == CommandOutcome::Applied {
            info!(command = %command.as_str(), state = %self.machine.state().tag().as_str(), "command_applied");
        }
        self.after_transition(&events);
        events
    }

    /// Process one reading
    pub fn step(&mut self, reading: Reading) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if let Some(last) = self.last_timestamp {
            if reading.timestamp < last {
                self.metrics.record_clock_anomaly();
                warn!(
                    behind_us = %last.duration_since(reading.timestamp).as_micros(),
                    "clock_anomaly_reading_discarded"
                );
                outcome.discarded = true;
                return outcome;
            }
        }
        self.last_timestamp = Some(reading.timestamp);
        self.last_reading = Some(reading);
        if !reading.valid {
            self.metrics.record_invalid_reading();
        }

        let detection = self.detector.process(&reading);
        if let Some(health) = detection.health_changed {
            self.metrics.set_sensor_health(health);
            match health {
                SensorHealth::Degraded => warn!(
                    invalid_streak = self.detector.invalid_streak(),
                    state = %self.machine.state().tag().as_str(),
                    "sensor_degraded"
                ),
                _ => info!(health = %health.as_str(), "sensor_health_changed"),
            }
            outcome
                .events
                .push(RaceEvent::SensorHealthChanged { health, at: reading.timestamp });
        }
        if detection.debounced {
            self.metrics.record_crossing_debounced();
        }

        if !self.detector.health().is_degraded() {
            outcome.events.extend(self.machine.on_tick(reading.timestamp));
        }

        if let Some(crossing) = detection.crossing {
            self.metrics.record_crossing();
            let (disposition, events) = self.machine.on_crossing(crossing);
            if disposition == CrossingOutcome::TooShort {
                self.metrics.record_short_lap_rejected();
            }
            outcome.events.extend(events);
        }

        self.after_transition(&outcome.events);
        outcome
    }

    fn after_transition(&self, events: &RaceEvents) {
        for event in events {
            match event {
                RaceEvent::LapCompleted(_) => self.metrics.record_lap_completed(),
                RaceEvent::LapDnf(_) => self.metrics.record_lap_dnf(),
                _ => {}
            }
        }
        if !events.is_empty() {
            self.metrics.set_race_state(self.machine.state().tag());
        }
    }

    #[inline]
    pub fn state(&self) -> RaceState {
        self.machine.state()
    }

    #[inline]
    pub fn health(&self) -> SensorHealth {
        self.detector.health()
    }

    #[inline]
    pub fn history(&self) -> &LapHistory {
        self.machine.history()
    }

    /// Latest reading of any validity
    pub fn last_reading(&self) -> Option<Reading> {
        self.last_reading
    }

    pub fn last_valid_reading(&self) -> Option<Reading> {
        self.detector.last_valid()
    }

    pub fn invalid_streak(&self) -> u32 {
        self.detector.invalid_streak()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::race::RaceStateTag;
    use std::time::Duration;

    fn params() -> TimingParams {
        TimingParams {
            crossing_threshold_cm: 50.0,
            debounce: Duration::from_secs(2),
            dnf_timeout: Duration::from_secs(45),
            reset_delay: Duration::from_secs(5),
            minimum_lap_time: Duration::from_secs(3),
            sensor_timeout: Duration::from_millis(500),
            ..TimingParams::default()
        }
    }

    fn engine() -> TimingEngine {
        TimingEngine::new(&params(), Arc::new(Metrics::new()))
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_clock_anomaly_is_discarded() {
        let mut engine = engine();
        let base = Instant::now();
        engine.apply_command(RaceCommand::Start, base);

        engine.step(Reading::valid(200.0, at(base, 100)));
        let outcome = engine.step(Reading::valid(30.0, at(base, 50)));
        assert!(outcome.discarded);
        assert!(outcome.events.is_empty());
        assert_eq!(engine.state(), RaceState::Ready);
        assert_eq!(engine.metrics.peek().clock_anomalies_total, 1);
    }

    #[test]
    fn test_deadlines_frozen_while_degraded() {
        let mut engine = engine();
        let base = Instant::now();
        engine.apply_command(RaceCommand::Start, base);
        engine.step(Reading::valid(200.0, at(base, 0)));
        engine.step(Reading::valid(30.0, at(base, 10)));
        assert_eq!(engine.state().tag(), RaceStateTag::Timing);

        // Sensor goes dark well past the DNF timeout
        for i in 1..=5000u64 {
            engine.step(Reading::invalid(at(base, 10 + i * 10)));
        }
        assert_eq!(engine.health(), SensorHealth::Degraded);
        assert_eq!(engine.state().tag(), RaceStateTag::Timing);
        assert!(engine.history().is_empty());

        // On recovery the overdue DNF is applied with its original deadline
        let outcome = engine.step(Reading::valid(200.0, at(base, 50_020)));
        let kinds: Vec<_> = outcome.events.iter().map(RaceEvent::kind).collect();
        assert_eq!(kinds[0], "sensor_health");
        assert!(kinds.contains(&"lap_dnf"));
        assert_eq!(engine.history().last().unwrap().duration, Duration::from_secs(45));
    }

    #[test]
    fn test_deadline_precedes_crossing_in_same_tick() {
        let mut engine = engine();
        let base = Instant::now();
        engine.apply_command(RaceCommand::Start, base);
        engine.step(Reading::valid(200.0, at(base, 0)));
        engine.step(Reading::valid(30.0, at(base, 10)));
        engine.step(Reading::valid(200.0, at(base, 20)));

        // Rider arrives on the exact tick the DNF deadline falls on
        let outcome = engine.step(Reading::valid(30.0, at(base, 45_010)));
        let kinds: Vec<_> = outcome.events.iter().map(RaceEvent::kind).collect();
        assert_eq!(kinds, vec!["state_changed", "lap_dnf", "state_changed"]);
        assert_eq!(engine.state().tag(), RaceStateTag::ResetCountdown);
    }

    #[test]
    fn test_metrics_follow_events() {
        let mut engine = engine();
        let base = Instant::now();
        engine.apply_command(RaceCommand::Start, base);
        engine.step(Reading::valid(200.0, at(base, 0)));
        engine.step(Reading::valid(30.0, at(base, 10)));
        engine.step(Reading::valid(200.0, at(base, 20)));
        engine.step(Reading::valid(30.0, at(base, 2_500)));
        engine.step(Reading::valid(200.0, at(base, 2_510)));
        engine.step(Reading::valid(30.0, at(base, 10_010)));

        let summary = engine.metrics.peek();
        assert_eq!(summary.crossings_total, 3);
        assert_eq!(summary.short_laps_rejected_total, 1);
        assert_eq!(summary.laps_completed_total, 1);
        assert_eq!(summary.commands_total, 1);
    }
}
