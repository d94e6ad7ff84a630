//! Telemetry payloads published over MQTT
//!
//! Mapping from race events and status snapshots to the JSON messages
//! downstream consumers (dashboard, logger) subscribe to.

use crate::domain::lap::{LapRecord, SessionStats};
use crate::domain::race::{RaceEvent, RaceState, RaceStateTag};
use crate::domain::types::SensorHealth;
use crate::services::status_store::RaceSnapshot;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Messages the MQTT publisher knows how to route
#[derive(Debug)]
pub enum TelemetryMessage {
    /// Lap completed (QoS 1)
    Lap(LapPayload),
    /// Lap timed out (QoS 1)
    Dnf(LapPayload),
    Status(StatusPayload),
    Statistics(StatisticsPayload),
    Health(HealthPayload),
}

impl TelemetryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryMessage::Lap(_) => "lap",
            TelemetryMessage::Dnf(_) => "dnf",
            TelemetryMessage::Status(_) => "status",
            TelemetryMessage::Statistics(_) => "stats",
            TelemetryMessage::Health(_) => "health",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            TelemetryMessage::Lap(p) | TelemetryMessage::Dnf(p) => serde_json::to_string(p),
            TelemetryMessage::Status(p) => serde_json::to_string(p),
            TelemetryMessage::Statistics(p) => serde_json::to_string(p),
            TelemetryMessage::Health(p) => serde_json::to_string(p),
        }
    }
}

/// Payload for lap completion and DNF
#[derive(Debug, Clone, Serialize)]
pub struct LapPayload {
    pub site: String,
    pub session_id: String,
    pub lap_number: usize,
    /// Lap time in seconds; for a DNF the timeout that elapsed
    pub duration: f64,
    /// "completed" or "dnf"
    pub status: &'static str,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// RFC 3339 wall-clock time the lap ended
    pub timestamp: String,
}

impl LapPayload {
    pub fn from_record(record: &LapRecord, site: &str, session_id: &str) -> Self {
        Self {
            site: site.to_string(),
            session_id: session_id.to_string(),
            lap_number: record.number,
            duration: record.duration_secs(),
            status: if record.is_success() { "completed" } else { "dnf" },
            ts: record.completed_at_utc.timestamp_millis().max(0) as u64,
            timestamp: record.completed_at_utc.to_rfc3339(),
        }
    }
}

/// Race and sensor state summary
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub site: String,
    pub ts: u64,
    pub race_state: RaceStateTag,
    pub state_label: &'static str,
    pub sensor_health: SensorHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_lap_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_lap_time: Option<f64>,
    pub total_laps: usize,
    pub total_dnf: usize,
}

/// Session statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsPayload {
    pub site: String,
    pub ts: u64,
    #[serde(flatten)]
    pub stats: SessionStats,
}

/// Sensor health detail
#[derive(Debug, Clone, Serialize)]
pub struct HealthPayload {
    pub site: String,
    pub ts: u64,
    pub sensor_health: SensorHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    pub invalid_streak: u32,
}

/// Builds payloads for one site
#[derive(Debug, Clone)]
pub struct TelemetryBuilder {
    site: String,
}

impl TelemetryBuilder {
    pub fn new(site: &str) -> Self {
        Self { site: site.to_string() }
    }

    pub fn status(&self, snapshot: &RaceSnapshot, now: Instant) -> StatusPayload {
        let view = snapshot.view(now);
        StatusPayload {
            site: self.site.clone(),
            ts: epoch_ms(),
            race_state: view.state,
            state_label: view.state_label,
            sensor_health: view.sensor_health,
            current_lap_time: view.current_lap_time,
            reset_remaining: view.reset_remaining,
            last_lap_time: view.last_lap_time,
            total_laps: view.total_laps,
            total_dnf: view.total_dnf,
        }
    }

    /// Status as of a state transition. The snapshot may already be past
    /// `state` when several transitions land in one tick.
    pub fn status_for(
        &self,
        state: RaceState,
        snapshot: &RaceSnapshot,
        now: Instant,
    ) -> StatusPayload {
        if snapshot.state == state {
            return self.status(snapshot, now);
        }
        let at_transition = RaceSnapshot { state, taken_at: now, ..snapshot.clone() };
        self.status(&at_transition, now)
    }

    pub fn statistics(&self, snapshot: &RaceSnapshot) -> StatisticsPayload {
        StatisticsPayload { site: self.site.clone(), ts: epoch_ms(), stats: snapshot.stats() }
    }

    pub fn health(&self, snapshot: &RaceSnapshot) -> HealthPayload {
        let reading = snapshot.last_reading;
        HealthPayload {
            site: self.site.clone(),
            ts: epoch_ms(),
            sensor_health: snapshot.sensor_health,
            distance_cm: reading.map(|r| r.distance_cm),
            signal_strength: reading.and_then(|r| r.strength),
            temperature_c: reading.and_then(|r| r.temperature_c),
            invalid_streak: snapshot.invalid_streak,
        }
    }

    /// Routine messages published on the periodic interval
    pub fn periodic(&self, snapshot: &RaceSnapshot, now: Instant) -> [TelemetryMessage; 3] {
        [
            TelemetryMessage::Status(self.status(snapshot, now)),
            TelemetryMessage::Statistics(self.statistics(snapshot)),
            TelemetryMessage::Health(self.health(snapshot)),
        ]
    }

    /// Messages triggered by a race event.
    /// `snapshot` must already reflect the event (the loop publishes it first).
    pub fn for_event(
        &self,
        event: &RaceEvent,
        snapshot: &RaceSnapshot,
        now: Instant,
    ) -> SmallVec<[TelemetryMessage; 2]> {
        match event {
            RaceEvent::LapCompleted(record) => smallvec![
                TelemetryMessage::Lap(LapPayload::from_record(
                    record,
                    &self.site,
                    &snapshot.session_id
                )),
                TelemetryMessage::Statistics(self.statistics(snapshot)),
            ],
            RaceEvent::LapDnf(record) => smallvec![
                TelemetryMessage::Dnf(LapPayload::from_record(
                    record,
                    &self.site,
                    &snapshot.session_id
                )),
                TelemetryMessage::Statistics(self.statistics(snapshot)),
            ],
            RaceEvent::SensorHealthChanged { .. } => smallvec![
                TelemetryMessage::Health(self.health(snapshot)),
                TelemetryMessage::Status(self.status(snapshot, now)),
            ],
            RaceEvent::StateChanged { state, .. } => {
                smallvec![TelemetryMessage::Status(self.status_for(*state, snapshot, now))]
            }
            RaceEvent::ResetArmed { .. } => SmallVec::new(),
        }
    }
}
