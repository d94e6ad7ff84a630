//! Race lifecycle state machine
//!
//! Owns the authoritative race state and the lap history. Three inputs drive
//! it, all with an explicit monotonic `now` so behavior is reproducible in
//! tests:
//! - operator commands (`handle_command`)
//! - debounced crossings (`on_crossing`)
//! - the passage of time (`on_tick`), for DNF and re-arm deadlines
//!
//! Completed and Dnf are announced and left within the same call; the
//! resting state after an attempt is ResetCountdown.

use crate::domain::lap::{LapHistory, LapOutcome, LapRecord};
use crate::domain::race::{RaceEvent, RaceState};
use crate::domain::types::{CrossingEvent, RaceCommand, SensorHealth};
use crate::infra::config::TimingParams;
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Events produced by one input; rarely more than three
pub type RaceEvents = SmallVec<[RaceEvent; 4]>;

/// How a command was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Command had no effect in the current state
    Ignored,
    /// Start refused because the sensor is degraded
    Refused,
}

/// What a crossing did to the race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingOutcome {
    LapStarted,
    LapFinished,
    /// Crossing inside the minimum lap time, treated as noise
    TooShort,
    /// No lap armed or in progress
    Ignored,
}

pub struct RaceStateMachine {
    dnf_timeout: Duration,
    reset_delay: Duration,
    minimum_lap_time: Duration,
    state: RaceState,
    /// Deadline for ResetCountdown -> Ready
    reset_deadline: Option<Instant>,
    history: LapHistory,
}

impl RaceStateMachine {
    pub fn new(params: &TimingParams) -> Self {
        Self {
            dnf_timeout: params.dnf_timeout,
            reset_delay: params.reset_delay,
            minimum_lap_time: params.minimum_lap_time,
            state: RaceState::Idle,
            reset_deadline: None,
            history: LapHistory::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> RaceState {
        self.state
    }

    #[inline]
    pub fn history(&self) -> &LapHistory {
        &self.history
    }

    /// Apply an operator command
    pub fn handle_command(
        &mut self,
        command: RaceCommand,
        now: Instant,
        health: SensorHealth,
    ) -> (CommandOutcome, RaceEvents) {
        let mut events = RaceEvents::new();

        let outcome = match (command, self.state) {
            (RaceCommand::Start, RaceState::Idle) => {
                if health.is_degraded() {
                    warn!("start_refused_sensor_degraded");
                    CommandOutcome::Refused
                } else {
                    self.transition(RaceState::Ready, now, &mut events);
                    CommandOutcome::Applied
                }
            }
            (RaceCommand::Start, _) => CommandOutcome::Ignored,
            (RaceCommand::Stop | RaceCommand::Reset, RaceState::Idle) => CommandOutcome::Ignored,
            (RaceCommand::Stop | RaceCommand::Reset, state) => {
                if let RaceState::Timing { started_at } = state {
                    info!(
                        elapsed_s = %now.saturating_duration_since(started_at).as_secs_f64(),
                        command = %command.as_str(),
                        "lap_discarded"
                    );
                }
                self.reset_deadline = None;
                self.transition(RaceState::Idle, now, &mut events);
                CommandOutcome::Applied
            }
            (RaceCommand::AbortLap, RaceState::Timing { started_at }) => {
                info!(
                    elapsed_s = %now.saturating_duration_since(started_at).as_secs_f64(),
                    "lap_aborted"
                );
                self.enter_reset_countdown(now, now, &mut events);
                CommandOutcome::Applied
            }
            (RaceCommand::AbortLap, _) => CommandOutcome::Ignored,
        };

        if outcome == CommandOutcome::Ignored {
            debug!(command = %command.as_str(), state = %self.state.tag().as_str(), "command_ignored");
        }
        (outcome, events)
    }

    /// Advance time-based transitions: DNF timeout and re-arm after the reset delay
    pub fn on_tick(&mut self, now: Instant) -> RaceEvents {
        let mut events = RaceEvents::new();

        match self.state {
            RaceState::Timing { started_at } => {
                let deadline = started_at + self.dnf_timeout;
                if now >= deadline {
                    let record =
                        self.history.append(self.dnf_timeout, deadline, LapOutcome::Dnf);
                    info!(
                        lap = record.number,
                        timeout_s = %self.dnf_timeout.as_secs_f64(),
                        "lap_dnf"
                    );
                    self.transition(RaceState::Dnf, deadline, &mut events);
                    events.push(RaceEvent::LapDnf(record));
                    self.enter_reset_countdown(deadline, now, &mut events);
                }
            }
            RaceState::ResetCountdown { .. } => self.advance_countdown(now, &mut events),
            _ => {}
        }

        events
    }

    /// Handle a debounced crossing
    pub fn on_crossing(&mut self, crossing: CrossingEvent) -> (CrossingOutcome, RaceEvents) {
        let mut events = RaceEvents::new();
        let at = crossing.timestamp;

        let outcome = match self.state {
            RaceState::Ready => {
                info!("lap_started");
                self.transition(RaceState::Timing { started_at: at }, at, &mut events);
                CrossingOutcome::LapStarted
            }
            RaceState::Timing { started_at } => {
                let elapsed = at.saturating_duration_since(started_at);
                if elapsed < self.minimum_lap_time {
                    debug!(elapsed_s = %elapsed.as_secs_f64(), "crossing_below_minimum_lap");
                    CrossingOutcome::TooShort
                } else {
                    let record = self.history.append(elapsed, at, LapOutcome::Success);
                    info!(lap = record.number, duration_s = %elapsed.as_secs_f64(), "lap_completed");
                    self.transition(RaceState::Completed { duration: elapsed }, at, &mut events);
                    events.push(RaceEvent::LapCompleted(record));
                    self.enter_reset_countdown(at, at, &mut events);
                    CrossingOutcome::LapFinished
                }
            }
            _ => CrossingOutcome::Ignored,
        };

        (outcome, events)
    }

    /// Remaining reset delay, if counting down
    pub fn reset_remaining(&self, now: Instant) -> Option<Duration> {
        self.reset_deadline.map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn last_lap(&self) -> Option<&LapRecord> {
        self.history.last()
    }

    fn transition(&mut self, next: RaceState, at: Instant, events: &mut RaceEvents) {
        debug!(from = %self.state.tag().as_str(), to = %next.tag().as_str(), "state_transition");
        self.state = next;
        events.push(RaceEvent::StateChanged { state: next, at });
    }

    /// Enter ResetCountdown with the delay measured from `from`
    fn enter_reset_countdown(&mut self, from: Instant, now: Instant, events: &mut RaceEvents) {
        let deadline = from + self.reset_delay;
        self.reset_deadline = Some(deadline);
        let remaining = deadline.saturating_duration_since(now);
        self.transition(RaceState::ResetCountdown { remaining }, from, events);
        // A DNF caught late (after a frozen stretch) may already be past re-arm
        self.advance_countdown(now, events);
    }

    fn advance_countdown(&mut self, now: Instant, events: &mut RaceEvents) {
        let Some(deadline) = self.reset_deadline else {
            return;
        };
        if now >= deadline {
            self.reset_deadline = None;
            self.transition(RaceState::Ready, now, events);
            events.push(RaceEvent::ResetArmed { at: now });
        } else {
            self.state = RaceState::ResetCountdown { remaining: deadline - now };
        }
    }
}
