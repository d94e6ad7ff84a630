//! Race state and race-lifecycle events

use crate::domain::lap::LapRecord;
use crate::domain::types::SensorHealth;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Authoritative race state, owned by the race state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Idle,
    Ready,
    Timing { started_at: Instant },
    Completed { duration: Duration },
    Dnf,
    ResetCountdown { remaining: Duration },
}

impl RaceState {
    #[inline]
    pub fn tag(&self) -> RaceStateTag {
        match self {
            RaceState::Idle => RaceStateTag::Idle,
            RaceState::Ready => RaceStateTag::Ready,
            RaceState::Timing { .. } => RaceStateTag::Timing,
            RaceState::Completed { .. } => RaceStateTag::Completed,
            RaceState::Dnf => RaceStateTag::Dnf,
            RaceState::ResetCountdown { .. } => RaceStateTag::ResetCountdown,
        }
    }
}

/// State discriminant without payload, for display and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStateTag {
    Idle,
    Ready,
    Timing,
    Completed,
    Dnf,
    ResetCountdown,
}

impl RaceStateTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStateTag::Idle => "idle",
            RaceStateTag::Ready => "ready",
            RaceStateTag::Timing => "timing",
            RaceStateTag::Completed => "completed",
            RaceStateTag::Dnf => "dnf",
            RaceStateTag::ResetCountdown => "reset_countdown",
        }
    }

    /// Human readable label for the presentation layer
    pub fn label(&self) -> &'static str {
        match self {
            RaceStateTag::Idle => "Idle",
            RaceStateTag::Ready => "Waiting for Racer",
            RaceStateTag::Timing => "Timing Lap",
            RaceStateTag::Completed => "Lap Completed",
            RaceStateTag::Dnf => "Did Not Finish",
            RaceStateTag::ResetCountdown => "Waiting for Next Racer",
        }
    }
}

/// Race-lifecycle events emitted by the timing loop
#[derive(Debug, Clone, PartialEq)]
pub enum RaceEvent {
    /// Any state transition
    StateChanged { state: RaceState, at: Instant },
    /// Timing -> Completed
    LapCompleted(LapRecord),
    /// Timing -> Dnf
    LapDnf(LapRecord),
    /// ResetCountdown -> Ready
    ResetArmed { at: Instant },
    /// Sensor health changed (degraded or recovered)
    SensorHealthChanged { health: SensorHealth, at: Instant },
}

impl RaceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RaceEvent::StateChanged { .. } => "state_changed",
            RaceEvent::LapCompleted(_) => "lap_completed",
            RaceEvent::LapDnf(_) => "lap_dnf",
            RaceEvent::ResetArmed { .. } => "reset_armed",
            RaceEvent::SensorHealthChanged { .. } => "sensor_health",
        }
    }

    /// Monotonic instant the event refers to
    pub fn at(&self) -> Instant {
        match self {
            RaceEvent::StateChanged { at, .. }
            | RaceEvent::ResetArmed { at }
            | RaceEvent::SensorHealthChanged { at, .. } => *at,
            RaceEvent::LapCompleted(record) | RaceEvent::LapDnf(record) => record.completed_at,
        }
    }
}
