//! End-to-end race scenarios driven through the timing engine
//!
//! Readings are synthesized at a 10 ms cadence from a distance profile, so
//! every timestamp is exact and transitions can be asserted to the tick.

use pumptrack_timer::domain::{LapOutcome, RaceCommand, RaceEvent, RaceState, RaceStateTag, Reading, SensorHealth};
use pumptrack_timer::infra::{Metrics, TimingParams};
use pumptrack_timer::services::TimingEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CADENCE_MS: u64 = 10;

fn params() -> TimingParams {
    TimingParams {
        crossing_threshold_cm: 50.0,
        hysteresis_cm: 0.0,
        debounce: Duration::from_secs(2),
        dnf_timeout: Duration::from_secs(45),
        reset_delay: Duration::from_secs(5),
        minimum_lap_time: Duration::from_secs(3),
        sample_interval: Duration::from_millis(CADENCE_MS),
        sensor_timeout: Duration::from_millis(500),
        snapshot_interval: Duration::from_millis(100),
    }
}

struct Harness {
    engine: TimingEngine,
    metrics: Arc<Metrics>,
    base: Instant,
    /// Next reading offset in ms
    next_ms: u64,
    /// Rider passes, each 100 ms long, as start offsets in ms
    passes: Vec<u64>,
}

impl Harness {
    fn new(passes: &[u64]) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self {
            engine: TimingEngine::new(&params(), metrics.clone()),
            metrics,
            base: Instant::now(),
            next_ms: 0,
            passes: passes.to_vec(),
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.base + Duration::from_millis(ms)
    }

    fn distance(&self, ms: u64) -> f64 {
        if self.passes.iter().any(|&start| ms >= start && ms < start + 100) {
            30.0
        } else {
            200.0
        }
    }

    fn command(&mut self, command: RaceCommand) -> Vec<RaceEvent> {
        let now = self.at(self.next_ms);
        self.engine.apply_command(command, now).into_vec()
    }

    /// Feed readings up to and including `ms`
    fn run_through(&mut self, ms: u64) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        while self.next_ms <= ms {
            let reading = Reading::valid(self.distance(self.next_ms), self.at(self.next_ms));
            events.extend(self.engine.step(reading).events);
            self.next_ms += CADENCE_MS;
        }
        events
    }

    /// Feed invalid readings up to and including `ms`
    fn dropout_through(&mut self, ms: u64) -> Vec<RaceEvent> {
        let mut events = Vec::new();
        while self.next_ms <= ms {
            events.extend(self.engine.step(Reading::invalid(self.at(self.next_ms))).events);
            self.next_ms += CADENCE_MS;
        }
        events
    }
}

fn transitions(events: &[RaceEvent]) -> Vec<(RaceStateTag, Instant)> {
    events
        .iter()
        .filter_map(|e| match e {
            RaceEvent::StateChanged { state, at } => Some((state.tag(), *at)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_debounced_crossing_and_reset() {
    let mut h = Harness::new(&[0, 1_000, 10_000]);
    h.command(RaceCommand::Start);

    let events = h.run_through(0);
    assert_eq!(transitions(&events), vec![(RaceStateTag::Timing, h.at(0))]);

    // Second pass at t=1.0 falls inside the debounce window
    let events = h.run_through(9_990);
    assert!(transitions(&events).is_empty());
    assert_eq!(h.metrics.peek().crossings_debounced_total, 1);

    let events = h.run_through(10_000);
    assert_eq!(
        transitions(&events),
        vec![(RaceStateTag::Completed, h.at(10_000)), (RaceStateTag::ResetCountdown, h.at(10_000))]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        RaceEvent::StateChanged { state: RaceState::Completed { duration }, .. }
            if *duration == Duration::from_secs(10)
    )));

    let events = h.run_through(14_990);
    assert!(transitions(&events).is_empty());
    assert_eq!(h.engine.state().tag(), RaceStateTag::ResetCountdown);

    let events = h.run_through(15_000);
    assert_eq!(transitions(&events), vec![(RaceStateTag::Ready, h.at(15_000))]);

    let laps = h.engine.history().shared();
    assert_eq!(laps.len(), 1);
    assert_eq!(laps[0].duration, Duration::from_secs(10));
    assert_eq!(laps[0].outcome, LapOutcome::Success);
}

#[test]
fn test_dnf_after_timeout() {
    let mut h = Harness::new(&[0]);
    h.command(RaceCommand::Start);
    h.run_through(44_990);
    assert_eq!(h.engine.state().tag(), RaceStateTag::Timing);

    let events = h.run_through(45_000);
    assert_eq!(transitions(&events)[0], (RaceStateTag::Dnf, h.at(45_000)));

    let laps = h.engine.history().shared();
    assert_eq!(laps.len(), 1);
    assert_eq!(laps[0].outcome, LapOutcome::Dnf);
    assert_eq!(laps[0].duration, Duration::from_secs(45));
    assert_eq!(h.metrics.peek().laps_dnf_total, 1);

    // Reset delay counts from the DNF instant
    h.run_through(50_000);
    assert_eq!(h.engine.state(), RaceState::Ready);
}

#[test]
fn test_ready_never_times_out() {
    let mut h = Harness::new(&[]);
    h.command(RaceCommand::Start);
    let events = h.run_through(120_000);
    assert!(transitions(&events).is_empty());
    assert_eq!(h.engine.state(), RaceState::Ready);
}

#[test]
fn test_dropout_while_timing_freezes_state() {
    let mut h = Harness::new(&[0]);
    h.command(RaceCommand::Start);
    h.run_through(990);

    let events = h.dropout_through(1_990);
    assert!(transitions(&events).is_empty());
    let degraded: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, RaceEvent::SensorHealthChanged { health: SensorHealth::Degraded, .. }))
        .collect();
    assert_eq!(degraded.len(), 1);
    assert_eq!(h.engine.invalid_streak(), 100);

    let events = h.run_through(2_000);
    assert!(events.iter().any(|e| matches!(
        e,
        RaceEvent::SensorHealthChanged { health: SensorHealth::Healthy, .. }
    )));
    assert_eq!(h.engine.state(), RaceState::Timing { started_at: h.at(0) });
}

#[test]
fn test_dnf_deadline_passed_during_dropout() {
    let mut h = Harness::new(&[0]);
    h.command(RaceCommand::Start);
    h.run_through(40_000);

    // Sensor is out across the DNF deadline and the reset delay
    let events = h.dropout_through(52_000);
    assert!(transitions(&events).is_empty());

    // First valid reading evaluates the frozen deadlines
    let events = h.run_through(52_010);
    let tags: Vec<_> = transitions(&events).into_iter().map(|(tag, _)| tag).collect();
    assert_eq!(tags, vec![RaceStateTag::Dnf, RaceStateTag::ResetCountdown, RaceStateTag::Ready]);
    assert_eq!(h.engine.history().shared()[0].completed_at, h.at(45_000));
}

#[test]
fn test_short_lap_is_ignored() {
    let mut h = Harness::new(&[0, 2_500, 8_000]);
    h.command(RaceCommand::Start);

    // Crossing at t=2.5 clears debounce but is under the minimum lap
    let events = h.run_through(7_990);
    assert_eq!(transitions(&events), vec![(RaceStateTag::Timing, h.at(0))]);
    assert_eq!(h.metrics.peek().short_laps_rejected_total, 1);

    h.run_through(8_000);
    let laps = h.engine.history().shared();
    assert_eq!(laps.len(), 1);
    assert_eq!(laps[0].duration, Duration::from_secs(8));
}

#[test]
fn test_clock_anomaly_is_discarded() {
    let mut h = Harness::new(&[]);
    h.run_through(100);

    let outcome = h.engine.step(Reading::valid(30.0, h.at(50)));
    assert!(outcome.discarded);
    assert!(outcome.events.is_empty());
    assert_eq!(h.metrics.peek().clock_anomalies_total, 1);
    assert_eq!(h.engine.last_reading().map(|r| r.timestamp), Some(h.at(100)));
}

#[test]
fn test_start_refused_while_degraded() {
    let mut h = Harness::new(&[]);
    h.dropout_through(600);
    assert_eq!(h.engine.health(), SensorHealth::Degraded);

    let events = h.command(RaceCommand::Start);
    assert!(events.is_empty());
    assert_eq!(h.engine.state(), RaceState::Idle);

    h.run_through(610);
    h.command(RaceCommand::Start);
    assert_eq!(h.engine.state(), RaceState::Ready);
}

#[test]
fn test_abort_lap_skips_recording() {
    let mut h = Harness::new(&[0]);
    h.command(RaceCommand::Start);
    h.run_through(5_000);

    let events = h.command(RaceCommand::AbortLap);
    assert_eq!(transitions(&events), vec![(RaceStateTag::ResetCountdown, h.at(5_010))]);
    assert!(h.engine.history().is_empty());

    h.run_through(10_010);
    assert_eq!(h.engine.state(), RaceState::Ready);
}

#[test]
fn test_session_statistics() {
    // Laps of 10 s and 12 s, then a DNF
    let mut h = Harness::new(&[0, 10_000, 20_000, 32_000, 40_000]);
    h.command(RaceCommand::Start);
    h.run_through(95_000);

    let stats = h.engine.history().stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.dnf_count, 1);
    assert_eq!(stats.best, Some(10.0));
    assert_eq!(stats.average, Some(11.0));
    assert_eq!(stats.total_race_time, 22.0);
    assert!((stats.completion_rate - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.last_laps, vec![10.0, 12.0]);

    let numbers: Vec<_> = h.engine.history().shared().iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn test_history_survives_stop_and_start() {
    let mut h = Harness::new(&[0, 10_000, 20_000]);
    h.command(RaceCommand::Start);
    h.run_through(15_000);
    h.command(RaceCommand::Stop);
    assert_eq!(h.engine.state(), RaceState::Idle);

    // Pass at t=20 while idle is not a lap start
    h.run_through(21_000);
    assert_eq!(h.engine.state(), RaceState::Idle);

    h.command(RaceCommand::Start);
    assert_eq!(h.engine.state(), RaceState::Ready);
    assert_eq!(h.engine.history().len(), 1);
}
