//! Visual indicator driver
//!
//! Consumes race-lifecycle events from the fan-out and renders one pattern
//! per state through an `IndicatorBackend`. The driver only sees state tags
//! and sensor health; pixel output is the backend's concern.

use crate::domain::race::{RaceEvent, RaceState, RaceStateTag};
use crate::domain::types::SensorHealth;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 80, 255);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const ORANGE: Color = Color::rgb(255, 120, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Animation {
    Solid,
    Breathing,
    Pulse,
    Flash,
    /// Fill draining over the given duration
    Countdown { over_ms: u64 },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pattern {
    pub color: Color,
    pub animation: Animation,
    /// 0-255
    pub brightness: u8,
}

/// Pattern for a race state. Degraded sensor health overrides the state.
pub fn pattern_for(state: &RaceState, health: SensorHealth) -> Pattern {
    if health.is_degraded() {
        return Pattern { color: Color::RED, animation: Animation::Heartbeat, brightness: 200 };
    }

    match state {
        RaceState::Idle => Pattern { color: Color::WHITE, animation: Animation::Solid, brightness: 40 },
        RaceState::Ready => {
            Pattern { color: Color::GREEN, animation: Animation::Breathing, brightness: 180 }
        }
        RaceState::Timing { .. } => {
            Pattern { color: Color::BLUE, animation: Animation::Pulse, brightness: 255 }
        }
        RaceState::Completed { .. } => {
            Pattern { color: Color::GREEN, animation: Animation::Flash, brightness: 255 }
        }
        RaceState::Dnf => Pattern { color: Color::RED, animation: Animation::Flash, brightness: 255 },
        RaceState::ResetCountdown { remaining } => Pattern {
            color: Color::ORANGE,
            animation: Animation::Countdown { over_ms: remaining.as_millis() as u64 },
            brightness: 200,
        },
    }
}

/// Output device for indicator patterns
#[async_trait]
pub trait IndicatorBackend: Send {
    async fn render(&mut self, pattern: &Pattern) -> anyhow::Result<()>;

    /// Turn the output off on shutdown
    async fn clear(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Backend that logs each pattern instead of driving hardware
#[derive(Debug, Default)]
pub struct LogBackend;

#[async_trait]
impl IndicatorBackend for LogBackend {
    async fn render(&mut self, pattern: &Pattern) -> anyhow::Result<()> {
        info!(
            r = pattern.color.r,
            g = pattern.color.g,
            b = pattern.color.b,
            animation = ?pattern.animation,
            brightness = pattern.brightness,
            "indicator_pattern"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// How long a lap-completed or DNF flash stays up before the next state shows
pub const FLASH_HOLD: Duration = Duration::from_millis(1500);

pub struct IndicatorDriver<B: IndicatorBackend> {
    backend: B,
    events: mpsc::Receiver<RaceEvent>,
    state: RaceState,
    health: SensorHealth,
    current: Option<Pattern>,
    /// Set while a flash is showing; later state changes wait for it
    hold_until: Option<Instant>,
}

impl<B: IndicatorBackend> IndicatorDriver<B> {
    pub fn new(backend: B, events: mpsc::Receiver<RaceEvent>) -> Self {
        Self {
            backend,
            events,
            state: RaceState::Idle,
            health: SensorHealth::Unknown,
            current: None,
            hold_until: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(backend = %self.backend.name(), "indicator_started");
        self.refresh().await;

        loop {
            let hold = self.hold_until;
            tokio::select! {
                _ = sleep_until(hold.unwrap_or_else(Instant::now)), if hold.is_some() => {
                    self.release_hold().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(&event).await,
                        None => break,
                    }
                }
            }
        }

        if let Err(e) = self.backend.clear().await {
            warn!(error = %e, "indicator_clear_failed");
        }
        info!("indicator_stopped");
    }

    pub async fn handle_event(&mut self, event: &RaceEvent) {
        if self.hold_until.is_some_and(|until| Instant::now() >= until) {
            self.release_hold().await;
        }

        match event {
            RaceEvent::StateChanged { state, .. } => {
                self.state = *state;
                if matches!(state, RaceState::Completed { .. } | RaceState::Dnf) {
                    self.hold_until = None;
                    self.refresh().await;
                    if !self.health.is_degraded() {
                        self.hold_until = Some(Instant::now() + FLASH_HOLD);
                    }
                    return;
                }
            }
            // Sensor trouble shows at once, even over a flash
            RaceEvent::SensorHealthChanged { health, .. } => {
                self.health = *health;
                self.hold_until = None;
            }
            RaceEvent::LapCompleted(_) | RaceEvent::LapDnf(_) | RaceEvent::ResetArmed { .. } => {
                return;
            }
        }

        if self.hold_until.is_none() {
            self.refresh().await;
        }
    }

    async fn release_hold(&mut self) {
        self.hold_until = None;
        self.refresh().await;
    }

    async fn refresh(&mut self) {
        let pattern = pattern_for(&self.state, self.health);
        if self.current == Some(pattern) {
            return;
        }
        match self.backend.render(&pattern).await {
            Ok(()) => {
                debug!(state = %self.state.tag().as_str(), "indicator_updated");
                self.current = Some(pattern);
            }
            Err(e) => warn!(error = %e, state = %self.state.tag().as_str(), "indicator_render_failed"),
        }
    }

    pub fn current(&self) -> Option<Pattern> {
        self.current
    }

    pub fn state_tag(&self) -> RaceStateTag {
        self.state.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct RecordingBackend {
        rendered: Arc<Mutex<Vec<Pattern>>>,
    }

    #[async_trait]
    impl IndicatorBackend for RecordingBackend {
        async fn render(&mut self, pattern: &Pattern) -> anyhow::Result<()> {
            self.rendered.lock().push(*pattern);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[test]
    fn test_pattern_per_state() {
        let healthy = SensorHealth::Healthy;
        assert_eq!(pattern_for(&RaceState::Idle, healthy).color, Color::WHITE);
        assert_eq!(pattern_for(&RaceState::Ready, healthy).animation, Animation::Breathing);
        let timing = RaceState::Timing { started_at: Instant::now() };
        assert_eq!(pattern_for(&timing, healthy).color, Color::BLUE);
        assert_eq!(pattern_for(&RaceState::Dnf, healthy).color, Color::RED);
        let countdown = RaceState::ResetCountdown { remaining: Duration::from_secs(5) };
        assert_eq!(
            pattern_for(&countdown, healthy).animation,
            Animation::Countdown { over_ms: 5_000 }
        );
    }

    #[test]
    fn test_degraded_overrides_state() {
        let pattern = pattern_for(&RaceState::Ready, SensorHealth::Degraded);
        assert_eq!(pattern.animation, Animation::Heartbeat);
        assert_eq!(pattern.color, Color::RED);
    }

    #[tokio::test]
    async fn test_driver_renders_on_state_change_only() {
        let backend = RecordingBackend::default();
        let rendered = backend.rendered.clone();
        let (_tx, rx) = mpsc::channel(8);
        let mut driver = IndicatorDriver::new(backend, rx);
        let at = Instant::now();

        driver.handle_event(&RaceEvent::StateChanged { state: RaceState::Ready, at }).await;
        driver.handle_event(&RaceEvent::ResetArmed { at }).await;
        driver.handle_event(&RaceEvent::StateChanged { state: RaceState::Ready, at }).await;
        driver
            .handle_event(&RaceEvent::SensorHealthChanged { health: SensorHealth::Degraded, at })
            .await;

        let rendered = rendered.lock();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].animation, Animation::Breathing);
        assert_eq!(rendered[1].animation, Animation::Heartbeat);
        assert_eq!(driver.state_tag(), RaceStateTag::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_holds_before_countdown() {
        let backend = RecordingBackend::default();
        let rendered = backend.rendered.clone();
        let (_tx, rx) = mpsc::channel(8);
        let mut driver = IndicatorDriver::new(backend, rx);
        let at = Instant::now();

        // Both transitions arrive in the same batch
        let completed = RaceState::Completed { duration: Duration::from_secs(12) };
        let countdown = RaceState::ResetCountdown { remaining: Duration::from_secs(5) };
        driver.handle_event(&RaceEvent::StateChanged { state: completed, at }).await;
        driver.handle_event(&RaceEvent::StateChanged { state: countdown, at }).await;

        assert_eq!(rendered.lock().len(), 1);
        assert_eq!(driver.current().map(|p| p.animation), Some(Animation::Flash));
        assert_eq!(driver.state_tag(), RaceStateTag::ResetCountdown);

        tokio::time::advance(FLASH_HOLD).await;
        driver.handle_event(&RaceEvent::ResetArmed { at }).await;

        let rendered = rendered.lock();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[1].animation, Animation::Countdown { over_ms: 5_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_flash_after_hold() {
        let backend = RecordingBackend::default();
        let rendered = backend.rendered.clone();
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = IndicatorDriver::new(backend, rx);
        let handle = tokio::spawn(driver.run(shutdown_rx));

        let at = Instant::now();
        tx.send(RaceEvent::StateChanged { state: RaceState::Dnf, at }).await.unwrap();
        tx.send(RaceEvent::StateChanged {
            state: RaceState::ResetCountdown { remaining: Duration::from_secs(5) },
            at,
        })
        .await
        .unwrap();

        tokio::time::sleep(FLASH_HOLD / 2).await;
        let flash = rendered.lock().last().map(|p| (p.color, p.animation));
        assert_eq!(flash, Some((Color::RED, Animation::Flash)));

        tokio::time::sleep(FLASH_HOLD).await;
        assert_eq!(rendered.lock().last().map(|p| p.color), Some(Color::ORANGE));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_sensor_cuts_flash_short() {
        let backend = RecordingBackend::default();
        let (_tx, rx) = mpsc::channel(8);
        let mut driver = IndicatorDriver::new(backend, rx);
        let at = Instant::now();

        driver.handle_event(&RaceEvent::StateChanged { state: RaceState::Dnf, at }).await;
        driver
            .handle_event(&RaceEvent::SensorHealthChanged { health: SensorHealth::Degraded, at })
            .await;

        assert_eq!(driver.current().map(|p| p.animation), Some(Animation::Heartbeat));
    }

    #[tokio::test]
    async fn test_run_stops_when_events_close() {
        let backend = RecordingBackend::default();
        let rendered = backend.rendered.clone();
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = IndicatorDriver::new(backend, rx);

        tx.send(RaceEvent::StateChanged { state: RaceState::Ready, at: Instant::now() })
            .await
            .unwrap();
        drop(tx);
        driver.run(shutdown_rx).await;

        // Idle on start, then Ready
        assert_eq!(rendered.lock().len(), 2);
    }
}
