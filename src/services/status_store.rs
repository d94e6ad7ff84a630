//! Shared status snapshots
//!
//! The timing loop is the only writer. It publishes immutable
//! `RaceSnapshot`s through a `watch` channel; readers clone the current
//! `Arc` and never hold a lock beyond that copy. A new snapshot replaces the
//! previous one as a whole, so readers never see a half-updated state.

use crate::domain::lap::{LapOutcome, LapRecord, SessionStats};
use crate::domain::race::{RaceState, RaceStateTag};
use crate::domain::types::{Reading, SensorHealth};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Consistent view of everything consumers need from the timing loop
#[derive(Debug, Clone)]
pub struct RaceSnapshot {
    /// Monotonic publication counter
    pub seq: u64,
    pub session_id: Arc<str>,
    pub state: RaceState,
    pub sensor_health: SensorHealth,
    /// Latest valid reading
    pub last_reading: Option<Reading>,
    pub invalid_streak: u32,
    pub laps: Arc<Vec<LapRecord>>,
    /// Loop instant the snapshot was taken
    pub taken_at: Instant,
}

impl RaceSnapshot {
    pub fn initial(session_id: Arc<str>) -> Self {
        Self {
            seq: 0,
            session_id,
            state: RaceState::Idle,
            sensor_health: SensorHealth::Unknown,
            last_reading: None,
            invalid_streak: 0,
            laps: Arc::new(Vec::new()),
            taken_at: Instant::now(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats::from_records(&self.laps)
    }

    pub fn last_lap(&self) -> Option<&LapRecord> {
        self.laps.last()
    }

    /// Presentation view with live values computed at `now`
    pub fn view(&self, now: Instant) -> StatusView {
        let tag = self.state.tag();
        let current_lap_time = match self.state {
            RaceState::Timing { started_at } => {
                Some(now.saturating_duration_since(started_at).as_secs_f64())
            }
            _ => None,
        };
        let reset_remaining = match self.state {
            RaceState::ResetCountdown { remaining } => {
                let since = now.saturating_duration_since(self.taken_at);
                Some(remaining.saturating_sub(since).as_secs_f64())
            }
            _ => None,
        };
        let stats = self.stats();
        let last_lap = self.last_lap();
        let state_label = match (tag, last_lap.map(|r| r.outcome)) {
            (RaceStateTag::ResetCountdown, Some(LapOutcome::Dnf)) => "Waiting After DNF",
            _ => tag.label(),
        };

        StatusView {
            session_id: self.session_id.to_string(),
            seq: self.seq,
            state: tag,
            state_label,
            current_lap_time,
            reset_remaining,
            last_lap_time: last_lap.filter(|r| r.is_success()).map(LapRecord::duration_secs),
            last_lap_outcome: last_lap.map(|r| r.outcome.as_str()),
            total_laps: stats.count,
            total_dnf: stats.dnf_count,
            best_lap: stats.best,
            sensor_health: self.sensor_health,
            current_distance: self.last_reading.map(|r| r.distance_cm),
            signal_strength: self.last_reading.and_then(|r| r.strength),
            temperature_c: self.last_reading.and_then(|r| r.temperature_c),
            invalid_streak: self.invalid_streak,
        }
    }
}

/// Serializable status for the web API and MQTT status topic
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub session_id: String,
    pub seq: u64,
    pub state: RaceStateTag,
    pub state_label: &'static str,
    /// Seconds into the running lap
    pub current_lap_time: Option<f64>,
    /// Seconds until the gate re-arms
    pub reset_remaining: Option<f64>,
    pub last_lap_time: Option<f64>,
    pub last_lap_outcome: Option<&'static str>,
    pub total_laps: usize,
    pub total_dnf: usize,
    pub best_lap: Option<f64>,
    pub sensor_health: SensorHealth,
    pub current_distance: Option<f64>,
    pub signal_strength: Option<u16>,
    pub temperature_c: Option<f64>,
    pub invalid_streak: u32,
}

/// Write half, owned by the timing loop
pub struct StatusPublisher {
    tx: watch::Sender<Arc<RaceSnapshot>>,
    seq: u64,
}

impl StatusPublisher {
    /// Replace the current snapshot, stamping it with the next sequence number
    pub fn publish(&mut self, mut snapshot: RaceSnapshot) {
        self.seq += 1;
        snapshot.seq = self.seq;
        // send_replace never fails, even with no readers left
        self.tx.send_replace(Arc::new(snapshot));
    }

    pub fn store(&self) -> StatusStore {
        StatusStore { rx: self.tx.subscribe() }
    }
}

/// Read half, cheap to clone
#[derive(Clone)]
pub struct StatusStore {
    rx: watch::Receiver<Arc<RaceSnapshot>>,
}

impl StatusStore {
    /// Latest published snapshot
    pub fn read(&self) -> Arc<RaceSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next publication. Returns false once the writer is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Create a connected publisher/store pair seeded with an Idle snapshot
pub fn status_channel(session_id: Arc<str>) -> (StatusPublisher, StatusStore) {
    let (tx, rx) = watch::channel(Arc::new(RaceSnapshot::initial(session_id)));
    (StatusPublisher { tx, seq: 0 }, StatusStore { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lap::{LapHistory, LapOutcome};
    use std::time::Duration;

    #[test]
    fn test_initial_snapshot_is_idle() {
        let (_publisher, store) = status_channel(Arc::from("session"));
        let snapshot = store.read();
        assert_eq!(snapshot.seq, 0);
        assert_eq!(snapshot.state, RaceState::Idle);
        assert_eq!(snapshot.sensor_health, SensorHealth::Unknown);
        assert!(snapshot.laps.is_empty());
    }

    #[test]
    fn test_reader_keeps_old_snapshot() {
        let (mut publisher, store) = status_channel(Arc::from("session"));
        let before = store.read();

        let mut next = RaceSnapshot::initial(Arc::from("session"));
        next.state = RaceState::Ready;
        publisher.publish(next);

        assert_eq!(before.state, RaceState::Idle);
        let after = store.read();
        assert_eq!(after.state, RaceState::Ready);
        assert_eq!(after.seq, 1);
    }

    #[test]
    fn test_view_computes_live_values() {
        let now = Instant::now();
        let mut snapshot = RaceSnapshot::initial(Arc::from("session"));
        snapshot.taken_at = now;
        snapshot.state = RaceState::Timing { started_at: now };

        let view = snapshot.view(now + Duration::from_millis(1500));
        assert_eq!(view.current_lap_time, Some(1.5));
        assert_eq!(view.reset_remaining, None);
        assert_eq!(view.state_label, "Timing Lap");

        snapshot.state = RaceState::ResetCountdown { remaining: Duration::from_secs(5) };
        let view = snapshot.view(now + Duration::from_secs(2));
        assert_eq!(view.reset_remaining, Some(3.0));
        assert_eq!(view.current_lap_time, None);
    }

    #[test]
    fn test_view_lap_summary() {
        let now = Instant::now();
        let mut history = LapHistory::new();
        history.append(Duration::from_secs(12), now, LapOutcome::Success);
        history.append(Duration::from_secs(45), now, LapOutcome::Dnf);

        let mut snapshot = RaceSnapshot::initial(Arc::from("session"));
        snapshot.laps = history.shared();
        snapshot.last_reading = Some(Reading::valid(180.0, now).with_strength(900));

        let view = snapshot.view(now);
        assert_eq!(view.total_laps, 1);
        assert_eq!(view.total_dnf, 1);
        assert_eq!(view.best_lap, Some(12.0));
        assert_eq!(view.last_lap_outcome, Some("dnf"));
        assert_eq!(view.last_lap_time, None);
        assert_eq!(view.current_distance, Some(180.0));
        assert_eq!(view.signal_strength, Some(900));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "idle");

        snapshot.state = RaceState::ResetCountdown { remaining: Duration::from_secs(5) };
        assert_eq!(snapshot.view(now).state_label, "Waiting After DNF");
        history.append(Duration::from_secs(14), now, LapOutcome::Success);
        snapshot.laps = history.shared();
        assert_eq!(snapshot.view(now).state_label, "Waiting for Next Racer");
        assert_eq!(json["sensor_health"], "unknown");
    }

    #[tokio::test]
    async fn test_changed_wakes_reader() {
        let (mut publisher, mut store) = status_channel(Arc::from("session"));
        let mut reader = store.clone();

        let handle = tokio::spawn(async move { reader.changed().await });
        publisher.publish(RaceSnapshot::initial(Arc::from("session")));
        assert!(handle.await.unwrap());

        drop(publisher);
        // The unseen publication is still delivered, then the closed writer shows
        assert!(store.changed().await);
        assert!(!store.changed().await);
    }
}
