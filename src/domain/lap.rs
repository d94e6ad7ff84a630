//! Lap records, session history and derived statistics

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of recent laps reported in statistics
const RECENT_LAPS: usize = 5;

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Wall-clock time of a past monotonic instant. A deadline applied late
/// (after a sensor dropout) keeps its own time rather than the append time.
fn wall_clock_at(at: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(at);
    Utc::now() - TimeDelta::from_std(age).unwrap_or_else(|_| TimeDelta::zero())
}

/// Outcome of one timed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LapOutcome {
    Success,
    Dnf,
}

impl LapOutcome {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            LapOutcome::Success => "success",
            LapOutcome::Dnf => "dnf",
        }
    }
}

/// One finished attempt. Never mutated after it enters the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LapRecord {
    /// 1-based position in the session history
    pub number: usize,
    #[serde(rename = "duration", serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Monotonic instant the lap ended (crossing or DNF deadline)
    #[serde(skip)]
    pub completed_at: Instant,
    /// Wall-clock time for consumers outside the process
    pub completed_at_utc: DateTime<Utc>,
    pub outcome: LapOutcome,
}

impl LapRecord {
    #[inline]
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.outcome == LapOutcome::Success
    }
}

/// Append-only lap history owned by the race state machine
///
/// Records live behind an `Arc` so snapshots can share them; appending while
/// a snapshot still holds the previous vector copies it first.
#[derive(Debug, Clone, Default)]
pub struct LapHistory {
    records: Arc<Vec<LapRecord>>,
}

impl LapHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lap, assigning the next lap number. Returns the stored record.
    pub fn append(
        &mut self,
        duration: Duration,
        completed_at: Instant,
        outcome: LapOutcome,
    ) -> LapRecord {
        let record = LapRecord {
            number: self.records.len() + 1,
            duration,
            completed_at,
            completed_at_utc: wall_clock_at(completed_at),
            outcome,
        };
        Arc::make_mut(&mut self.records).push(record.clone());
        record
    }

    /// Shared, immutable view of all records
    pub fn shared(&self) -> Arc<Vec<LapRecord>> {
        Arc::clone(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&LapRecord> {
        self.records.last()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats::from_records(&self.records)
    }
}

/// Aggregate statistics, always recomputed from the records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    /// Completed (successful) laps
    pub count: usize,
    /// Average completed lap in seconds
    pub average: Option<f64>,
    /// Fastest completed lap in seconds
    pub best: Option<f64>,
    pub total_attempts: usize,
    pub dnf_count: usize,
    /// Completed / attempts in percent
    pub completion_rate: f64,
    /// Sum of completed laps in seconds
    pub total_race_time: f64,
    /// Up to the last five completed laps, oldest first
    pub last_laps: Vec<f64>,
}

impl SessionStats {
    pub fn from_records(records: &[LapRecord]) -> Self {
        let completed: Vec<f64> =
            records.iter().filter(|r| r.is_success()).map(LapRecord::duration_secs).collect();
        let count = completed.len();
        let total_attempts = records.len();
        let total_race_time: f64 = completed.iter().sum();

        let average = if count > 0 { Some(total_race_time / count as f64) } else { None };
        let best = completed.iter().copied().reduce(f64::min);
        let completion_rate = if total_attempts > 0 {
            count as f64 / total_attempts as f64 * 100.0
        } else {
            0.0
        };
        let last_laps = completed[count.saturating_sub(RECENT_LAPS)..].to_vec();

        Self {
            count,
            average,
            best,
            total_attempts,
            dnf_count: total_attempts - count,
            completion_rate,
            total_race_time,
            last_laps,
        }
    }
}
