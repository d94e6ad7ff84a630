//! Tests for the timing loop

use super::*;
use crate::domain::lap::LapOutcome;
use crate::domain::race::{RaceState, RaceStateTag};
use crate::domain::types::{Reading, SensorHealth};
use crate::io::sampler::ReplaySampler;
use crate::services::status_store::{status_channel, StatusStore};
use std::time::Duration;

/// Test harness that keeps the command sender and event receiver alive
struct TestLoop {
    timing: TimingLoop<ReplaySampler>,
    commands: CommandSender,
    store: StatusStore,
    events: mpsc::Receiver<RaceEvent>,
    metrics: Arc<Metrics>,
}

impl std::ops::Deref for TestLoop {
    type Target = TimingLoop<ReplaySampler>;
    fn deref(&self) -> &Self::Target {
        &self.timing
    }
}

impl std::ops::DerefMut for TestLoop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.timing
    }
}

impl TestLoop {
    async fn run_ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.timing.tick().await;
        }
    }

    fn drain_events(&mut self) -> Vec<RaceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn params() -> TimingParams {
    TimingParams {
        crossing_threshold_cm: 50.0,
        hysteresis_cm: 0.0,
        debounce: millis(2_000),
        dnf_timeout: millis(45_000),
        reset_delay: millis(5_000),
        minimum_lap_time: millis(3_000),
        sample_interval: millis(10),
        sensor_timeout: millis(500),
        snapshot_interval: millis(100),
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn create_test_loop(sampler: ReplaySampler, event_capacity: usize) -> TestLoop {
    let metrics = Arc::new(Metrics::new());
    let (commands, command_rx) = command_channel();
    let (publisher, store) = status_channel(Arc::from("test-session"));
    let mut fanout = EventFanout::new(metrics.clone());
    let events = fanout.subscribe("test", event_capacity);
    let timing = TimingLoop::new(
        params(),
        sampler,
        command_rx,
        publisher,
        fanout,
        Arc::from("test-session"),
        metrics.clone(),
    );
    TestLoop { timing, commands, store, events, metrics }
}

/// Rider passes (30 cm) lasting 100 ms starting at each of `passes_ms`, 200 cm otherwise
fn pass_profile(passes_ms: &'static [u64]) -> impl Fn(u64) -> f64 {
    move |ms| {
        if passes_ms.iter().any(|&start| ms >= start && ms < start + 100) {
            30.0
        } else {
            200.0
        }
    }
}

/// Index of the tick whose reading is taken at `ms`
fn ticks_through(ms: u64) -> usize {
    (ms / 10) as usize + 1
}

fn state_changes(events: &[RaceEvent]) -> Vec<(RaceStateTag, Instant)> {
    events
        .iter()
        .filter_map(|e| match e {
            RaceEvent::StateChanged { state, at } => Some((state.tag(), *at)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_debounced_lap_scenario() {
    let base = Instant::now();
    let sampler =
        ReplaySampler::from_profile(base, millis(10), millis(16_000), pass_profile(&[0, 1_000, 10_000]));
    let mut t = create_test_loop(sampler, 256);
    t.commands.send(RaceCommand::Start).unwrap();

    // Through t=0.0: armed, then the first crossing starts the lap
    t.run_ticks(ticks_through(0)).await;
    assert_eq!(t.store.read().state, RaceState::Timing { started_at: base });

    // Through t=1.0 and the rest of the pass: suppressed by debounce
    t.run_ticks(ticks_through(1_200) - ticks_through(0)).await;
    assert_eq!(t.store.read().state, RaceState::Timing { started_at: base });
    assert_eq!(t.metrics.peek().crossings_debounced_total, 1);

    // t=10.0: second real crossing completes the lap
    t.run_ticks(ticks_through(10_000) - ticks_through(1_200)).await;
    let snapshot = t.store.read();
    assert_eq!(snapshot.state.tag(), RaceStateTag::ResetCountdown);
    assert_eq!(snapshot.laps.len(), 1);
    assert_eq!(snapshot.laps[0].duration, millis(10_000));
    assert_eq!(snapshot.laps[0].outcome, LapOutcome::Success);

    // Counting down just before t=15.0, armed at t=15.0
    t.run_ticks(ticks_through(14_990) - ticks_through(10_000)).await;
    assert_eq!(t.store.read().state.tag(), RaceStateTag::ResetCountdown);
    t.run_ticks(1).await;
    assert_eq!(t.store.read().state, RaceState::Ready);

    let events = t.drain_events();
    let changes = state_changes(&events);
    let expected = vec![
        (RaceStateTag::Ready, changes[0].1),
        (RaceStateTag::Timing, base),
        (RaceStateTag::Completed, base + millis(10_000)),
        (RaceStateTag::ResetCountdown, base + millis(10_000)),
        (RaceStateTag::Ready, base + millis(15_000)),
    ];
    assert_eq!(changes, expected);
    assert!(events.iter().any(|e| matches!(
        e,
        RaceEvent::StateChanged { state: RaceState::Completed { duration }, .. } if *duration == millis(10_000)
    )));
    assert!(events.iter().any(|e| matches!(e, RaceEvent::ResetArmed { .. })));
}

#[tokio::test]
async fn test_dnf_scenario() {
    let base = Instant::now();
    let sampler = ReplaySampler::from_profile(base, millis(10), millis(46_000), pass_profile(&[0]));
    let mut t = create_test_loop(sampler, 256);
    t.commands.send(RaceCommand::Start).unwrap();

    t.run_ticks(ticks_through(44_990)).await;
    assert_eq!(t.store.read().state.tag(), RaceStateTag::Timing);
    assert!(t.store.read().laps.is_empty());

    t.run_ticks(1).await;
    let snapshot = t.store.read();
    assert_eq!(snapshot.state.tag(), RaceStateTag::ResetCountdown);
    assert_eq!(snapshot.laps.len(), 1);
    assert_eq!(snapshot.laps[0].outcome, LapOutcome::Dnf);
    assert_eq!(snapshot.laps[0].duration, millis(45_000));
    assert_eq!(snapshot.laps[0].completed_at, base + millis(45_000));

    let events = t.drain_events();
    let dnf_at = events.iter().find_map(|e| match e {
        RaceEvent::StateChanged { state: RaceState::Dnf, at } => Some(*at),
        _ => None,
    });
    assert_eq!(dnf_at, Some(base + millis(45_000)));
    assert!(events.iter().any(|e| matches!(e, RaceEvent::LapDnf(r) if r.duration == millis(45_000))));
}

#[tokio::test]
async fn test_sensor_dropout_while_timing() {
    let base = Instant::now();
    let mut readings = Vec::new();
    for i in 0..=300u64 {
        let ts = base + millis(i * 10);
        let reading = match i {
            // Start crossing at t=0.0
            0..=9 => Reading::valid(30.0, ts),
            // 100 consecutive invalid ticks
            100..=199 => Reading::invalid(ts),
            _ => Reading::valid(200.0, ts),
        };
        readings.push(reading);
    }
    let mut t = create_test_loop(ReplaySampler::new(readings, millis(10)), 256);
    t.commands.send(RaceCommand::Start).unwrap();

    t.run_ticks(100).await;
    t.drain_events();
    assert_eq!(t.store.read().state.tag(), RaceStateTag::Timing);

    t.run_ticks(100).await;
    let during = t.drain_events();
    assert!(state_changes(&during).is_empty());
    let health: Vec<_> = during
        .iter()
        .filter_map(|e| match e {
            RaceEvent::SensorHealthChanged { health, .. } => Some(*health),
            _ => None,
        })
        .collect();
    assert_eq!(health, vec![SensorHealth::Degraded]);
    assert_eq!(t.store.read().sensor_health, SensorHealth::Degraded);
    assert_eq!(t.engine().invalid_streak(), 100);

    // First valid reading restores health; timing carries on
    t.run_ticks(1).await;
    let after = t.drain_events();
    assert!(after.iter().any(|e| matches!(
        e,
        RaceEvent::SensorHealthChanged { health: SensorHealth::Healthy, .. }
    )));
    assert_eq!(t.store.read().state, RaceState::Timing { started_at: base });
    assert_eq!(t.metrics.peek().readings_invalid_total, 100);
}

#[tokio::test]
async fn test_snapshot_cadence_without_events() {
    let base = Instant::now();
    let sampler = ReplaySampler::from_profile(base, millis(10), millis(1_000), |_| 200.0);
    let mut t = create_test_loop(sampler, 256);

    // First tick publishes (health becomes healthy), then one every 100 ms
    t.run_ticks(ticks_through(1_000)).await;
    assert_eq!(t.store.read().seq, 11);
    assert_eq!(t.store.read().state, RaceState::Idle);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_stall_timing() {
    let base = Instant::now();
    let sampler =
        ReplaySampler::from_profile(base, millis(10), millis(16_000), pass_profile(&[0, 10_000]));
    // Capacity one and never drained during the run
    let mut t = create_test_loop(sampler, 1);
    t.commands.send(RaceCommand::Start).unwrap();

    t.run_ticks(ticks_through(15_000)).await;

    assert_eq!(t.store.read().state, RaceState::Ready);
    assert_eq!(t.store.read().laps.len(), 1);
    assert!(t.metrics.peek().events_dropped_total > 0);
    assert_eq!(t.drain_events().len(), 1);
}

#[tokio::test]
async fn test_stop_command_discards_lap() {
    let base = Instant::now();
    let sampler =
        ReplaySampler::from_profile(base, millis(10), millis(5_000), pass_profile(&[0]));
    let mut t = create_test_loop(sampler, 256);
    t.commands.send(RaceCommand::Start).unwrap();
    t.run_ticks(ticks_through(2_000)).await;
    assert_eq!(t.store.read().state.tag(), RaceStateTag::Timing);

    t.commands.send(RaceCommand::Stop).unwrap();
    t.run_ticks(1).await;
    assert_eq!(t.store.read().state, RaceState::Idle);
    assert!(t.store.read().laps.is_empty());
    assert_eq!(t.engine().history().len(), 0);
}

#[test]
fn test_command_sender_reports_closed_loop() {
    let (commands, command_rx) = command_channel();
    drop(command_rx);
    assert_eq!(commands.send(RaceCommand::Start), Err(CommandError::LoopStopped));
}

#[test]
fn test_command_sender_reports_full_queue() {
    let (commands, _command_rx) = command_channel();
    for _ in 0..COMMAND_QUEUE_CAPACITY {
        commands.send(RaceCommand::Start).unwrap();
    }
    assert_eq!(commands.send(RaceCommand::Start), Err(CommandError::QueueFull));
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown() {
    let base = Instant::now();
    let sampler =
        ReplaySampler::from_profile(base, millis(10), millis(2_000), pass_profile(&[200]));
    let t = create_test_loop(sampler, 256);
    let TestLoop { timing, commands, store, metrics, events: _events } = t;

    commands.send(RaceCommand::Start).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(timing.run(shutdown_rx));

    tokio::time::sleep(millis(1_000)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.read().state.tag(), RaceStateTag::Timing);
    assert!(metrics.ticks_total() >= 50);
}
