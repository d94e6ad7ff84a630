//! Fixed-cadence timing loop
//!
//! The single writer of race state. Every tick:
//! 1. drains queued operator commands
//! 2. takes one reading from the sampler
//! 3. runs the engine (clock check, detection, deadlines, crossing)
//! 4. publishes a snapshot if anything changed or the snapshot interval passed
//! 5. fans out the tick's events, after the snapshot so consumers can read it
//!
//! Shutdown is observed between ticks; the sampler is released on exit.

#[cfg(test)]
mod tests;

use crate::domain::race::RaceEvent;
use crate::domain::types::RaceCommand;
use crate::infra::config::TimingParams;
use crate::infra::metrics::Metrics;
use crate::io::sampler::DistanceSampler;
use crate::services::engine::TimingEngine;
use crate::services::fanout::EventFanout;
use crate::services::race_machine::RaceEvents;
use crate::services::status_store::{RaceSnapshot, StatusPublisher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Queue depth for operator commands
pub const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Why a command could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    QueueFull,
    /// The timing loop has exited
    LoopStopped,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::QueueFull => write!(f, "command queue full"),
            CommandError::LoopStopped => write!(f, "timing loop not running"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Cloneable handle for queuing operator commands
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<RaceCommand>,
}

impl CommandSender {
    /// Queue a command without waiting
    pub fn send(&self, command: RaceCommand) -> Result<(), CommandError> {
        self.tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => CommandError::QueueFull,
            TrySendError::Closed(_) => CommandError::LoopStopped,
        })
    }
}

pub fn command_channel() -> (CommandSender, mpsc::Receiver<RaceCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    (CommandSender { tx }, rx)
}

pub struct TimingLoop<S: DistanceSampler> {
    params: TimingParams,
    engine: TimingEngine,
    sampler: S,
    commands: mpsc::Receiver<RaceCommand>,
    status: StatusPublisher,
    fanout: EventFanout,
    session_id: Arc<str>,
    metrics: Arc<Metrics>,
    last_snapshot_at: Option<Instant>,
}

impl<S: DistanceSampler> TimingLoop<S> {
    pub fn new(
        params: TimingParams,
        sampler: S,
        commands: mpsc::Receiver<RaceCommand>,
        status: StatusPublisher,
        fanout: EventFanout,
        session_id: Arc<str>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            params,
            engine: TimingEngine::new(&params, metrics.clone()),
            sampler,
            commands,
            status,
            fanout,
            session_id,
            metrics,
            last_snapshot_at: None,
        }
    }

    /// Run ticks until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sampler = %self.sampler.name(),
            interval_ms = %self.params.sample_interval.as_millis(),
            threshold_cm = %self.params.crossing_threshold_cm,
            session = %self.session_id,
            "timing_loop_started"
        );

        let mut ticker = interval(self.params.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped shutdown sender also stops the loop
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.sampler.release().await;
        info!(
            ticks = self.metrics.ticks_total(),
            laps = self.engine.history().len(),
            "timing_loop_stopped"
        );
    }

    /// One full tick
    pub async fn tick(&mut self) {
        let tick_start = Instant::now();
        let mut events = RaceEvents::new();

        while let Ok(command) = self.commands.try_recv() {
            events.extend(self.engine.apply_command(command, Instant::now()));
        }

        let reading = self.sampler.sample().await;
        let outcome = self.engine.step(reading);
        events.extend(outcome.events);

        let now = if outcome.discarded { tick_start } else { reading.timestamp };
        let due = self
            .last_snapshot_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.params.snapshot_interval);
        if !events.is_empty() || due {
            self.publish_snapshot(now);
        }

        for event in &events {
            self.log_event(event);
            self.fanout.publish(event);
        }

        let elapsed = tick_start.elapsed();
        self.metrics.record_tick(elapsed.as_micros() as u64);
        if elapsed > self.params.sample_interval {
            self.metrics.record_tick_overrun();
            debug!(elapsed_us = %elapsed.as_micros(), "tick_overrun");
        }
    }

    fn publish_snapshot(&mut self, now: Instant) {
        self.last_snapshot_at = Some(now);
        self.status.publish(RaceSnapshot {
            seq: 0,
            session_id: Arc::clone(&self.session_id),
            state: self.engine.state(),
            sensor_health: self.engine.health(),
            last_reading: self.engine.last_valid_reading(),
            invalid_streak: self.engine.invalid_streak(),
            laps: self.engine.history().shared(),
            taken_at: now,
        });
    }

    fn log_event(&self, event: &RaceEvent) {
        match event {
            RaceEvent::StateChanged { state, .. } => {
                info!(state = %state.tag().as_str(), "race_state");
            }
            RaceEvent::LapCompleted(record) | RaceEvent::LapDnf(record) => {
                debug!(lap = record.number, outcome = %record.outcome.as_str(), "lap_recorded");
            }
            RaceEvent::SensorHealthChanged { .. } | RaceEvent::ResetArmed { .. } => {}
        }
    }

    pub fn engine(&self) -> &TimingEngine {
        &self.engine
    }
}
