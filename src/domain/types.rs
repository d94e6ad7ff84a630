//! Shared types for the lap timer

use serde::Serialize;
use std::time::Instant;

/// One distance sample from the gate sensor
///
/// `valid = false` marks a failed read (bus timeout, bad checksum, weak
/// signal). Invalid readings still carry the instant the sample was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Distance in centimeters
    pub distance_cm: f64,
    /// Monotonic sample instant
    pub timestamp: Instant,
    pub valid: bool,
    /// Signal strength reported by the sensor (if it reports one)
    pub strength: Option<u16>,
    /// Sensor die temperature in °C (if reported)
    pub temperature_c: Option<f64>,
}

impl Reading {
    #[inline]
    pub fn valid(distance_cm: f64, timestamp: Instant) -> Self {
        Self { distance_cm, timestamp, valid: true, strength: None, temperature_c: None }
    }

    #[inline]
    pub fn invalid(timestamp: Instant) -> Self {
        Self { distance_cm: 0.0, timestamp, valid: false, strength: None, temperature_c: None }
    }

    pub fn with_strength(mut self, strength: u16) -> Self {
        self.strength = Some(strength);
        self
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = Some(temperature_c);
        self
    }
}

/// A debounced gate crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingEvent {
    pub timestamp: Instant,
}

/// Sensor health as seen by the crossing detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorHealth {
    /// No valid reading seen yet
    Unknown,
    Healthy,
    /// No valid reading for longer than the sensor timeout
    Degraded,
}

impl SensorHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorHealth::Unknown => "unknown",
            SensorHealth::Healthy => "healthy",
            SensorHealth::Degraded => "degraded",
        }
    }

    #[inline]
    pub fn is_degraded(&self) -> bool {
        matches!(self, SensorHealth::Degraded)
    }
}

/// Operator commands queued into the timing loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceCommand {
    /// Idle -> Ready
    Start,
    /// Any state -> Idle
    Stop,
    /// Any state -> Idle (operator reset)
    Reset,
    /// Timing -> ResetCountdown without recording a lap
    AbortLap,
}

impl RaceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceCommand::Start => "start",
            RaceCommand::Stop => "stop",
            RaceCommand::Reset => "reset",
            RaceCommand::AbortLap => "abort",
        }
    }
}

impl std::str::FromStr for RaceCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(RaceCommand::Start),
            "stop" => Ok(RaceCommand::Stop),
            "reset" => Ok(RaceCommand::Reset),
            "abort" => Ok(RaceCommand::AbortLap),
            other => Err(format!("unknown command: {other}")),
        }
    }
}
