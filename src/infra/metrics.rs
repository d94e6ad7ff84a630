//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the timing loop never waits on a
//! lock. Reporting is the only operation that needs synchronization (via
//! atomic swap of the periodic counters).
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::race::RaceStateTag;
use crate::domain::types::SensorHealth;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Race state values for the Prometheus gauge
fn race_state_value(tag: RaceStateTag) -> u64 {
    match tag {
        RaceStateTag::Idle => 0,
        RaceStateTag::Ready => 1,
        RaceStateTag::Timing => 2,
        RaceStateTag::Completed => 3,
        RaceStateTag::Dnf => 4,
        RaceStateTag::ResetCountdown => 5,
    }
}

fn sensor_health_value(health: SensorHealth) -> u64 {
    match health {
        SensorHealth::Unknown => 0,
        SensorHealth::Healthy => 1,
        SensorHealth::Degraded => 2,
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps the periodic counters.
pub struct Metrics {
    /// Total timing loop ticks (monotonic)
    ticks_total: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    /// Sum of tick latencies since last report (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Max tick latency since last report (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Tick latency histogram (cumulative)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of all tick latencies (cumulative, for the Prometheus histogram)
    tick_latency_total_us: AtomicU64,
    /// Ticks that took longer than the sample interval
    tick_overruns_total: AtomicU64,
    /// Readings with valid=false
    readings_invalid_total: AtomicU64,
    /// Readings discarded because their timestamp went backwards
    clock_anomalies_total: AtomicU64,
    /// Crossings emitted by the detector
    crossings_total: AtomicU64,
    /// Raw entries suppressed by the debounce window
    crossings_debounced_total: AtomicU64,
    /// Crossings ignored because the lap was shorter than the minimum
    short_laps_rejected_total: AtomicU64,
    laps_completed_total: AtomicU64,
    laps_dnf_total: AtomicU64,
    /// Operator commands processed by the timing loop
    commands_total: AtomicU64,
    /// Sensor health transitions into Degraded
    sensor_degraded_total: AtomicU64,
    /// Race events dropped because a subscriber queue was full
    events_dropped_total: AtomicU64,
    /// Telemetry publishes that failed at the MQTT client
    publish_failures_total: AtomicU64,
    /// Current race state (see `race_state_value`)
    race_state: AtomicU64,
    /// Current sensor health (0=unknown, 1=healthy, 2=degraded)
    sensor_health: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_total_us: AtomicU64::new(0),
            tick_overruns_total: AtomicU64::new(0),
            readings_invalid_total: AtomicU64::new(0),
            clock_anomalies_total: AtomicU64::new(0),
            crossings_total: AtomicU64::new(0),
            crossings_debounced_total: AtomicU64::new(0),
            short_laps_rejected_total: AtomicU64::new(0),
            laps_completed_total: AtomicU64::new(0),
            laps_dnf_total: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
            sensor_degraded_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            publish_failures_total: AtomicU64::new(0),
            race_state: AtomicU64::new(0),
            sensor_health: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one completed tick of the timing loop
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_latency_total_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_us, latency_us);
        self.tick_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tick_overrun(&self) {
        self.tick_overruns_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_reading(&self) {
        self.readings_invalid_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_clock_anomaly(&self) {
        self.clock_anomalies_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_crossing(&self) {
        self.crossings_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_crossing_debounced(&self) {
        self.crossings_debounced_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_short_lap_rejected(&self) {
        self.short_laps_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lap_completed(&self) {
        self.laps_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lap_dnf(&self) {
        self.laps_dnf_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_race_state(&self, tag: RaceStateTag) {
        self.race_state.store(race_state_value(tag), Ordering::Relaxed);
    }

    #[inline]
    pub fn set_sensor_health(&self, health: SensorHealth) {
        if health.is_degraded() {
            self.sensor_degraded_total.fetch_add(1, Ordering::Relaxed);
        }
        self.sensor_health.store(sensor_health_value(health), Ordering::Relaxed);
    }

    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_dropped_total(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary without resetting periodic counters (for scrapes)
    pub fn peek(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let take = |counter: &AtomicU64| {
            if reset {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };

        let ticks_count = take(&self.ticks_since_report);
        let latency_sum = take(&self.tick_latency_sum_us);
        let max_latency = take(&self.tick_latency_max_us);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ticks_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if ticks_count > 0 { latency_sum / ticks_count } else { 0 };

        let tick_lat_buckets = load_buckets(&self.tick_latency_buckets);

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_per_sec,
            avg_tick_latency_us: avg_latency,
            max_tick_latency_us: max_latency,
            tick_lat_p50_us: percentile_from_buckets(&tick_lat_buckets, 0.50),
            tick_lat_p99_us: percentile_from_buckets(&tick_lat_buckets, 0.99),
            tick_lat_buckets,
            tick_latency_total_us: self.tick_latency_total_us.load(Ordering::Relaxed),
            tick_overruns_total: self.tick_overruns_total.load(Ordering::Relaxed),
            readings_invalid_total: self.readings_invalid_total.load(Ordering::Relaxed),
            clock_anomalies_total: self.clock_anomalies_total.load(Ordering::Relaxed),
            crossings_total: self.crossings_total.load(Ordering::Relaxed),
            crossings_debounced_total: self.crossings_debounced_total.load(Ordering::Relaxed),
            short_laps_rejected_total: self.short_laps_rejected_total.load(Ordering::Relaxed),
            laps_completed_total: self.laps_completed_total.load(Ordering::Relaxed),
            laps_dnf_total: self.laps_dnf_total.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            sensor_degraded_total: self.sensor_degraded_total.load(Ordering::Relaxed),
            events_dropped_total: self.events_dropped_total.load(Ordering::Relaxed),
            publish_failures_total: self.publish_failures_total.load(Ordering::Relaxed),
            race_state: self.race_state.load(Ordering::Relaxed),
            sensor_health: self.sensor_health.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    /// 50th percentile tick latency (µs)
    pub tick_lat_p50_us: u64,
    /// 99th percentile tick latency (µs)
    pub tick_lat_p99_us: u64,
    /// Tick latency histogram buckets (cumulative since start)
    pub tick_lat_buckets: [u64; NUM_BUCKETS],
    pub tick_latency_total_us: u64,
    pub tick_overruns_total: u64,
    pub readings_invalid_total: u64,
    pub clock_anomalies_total: u64,
    pub crossings_total: u64,
    pub crossings_debounced_total: u64,
    pub short_laps_rejected_total: u64,
    pub laps_completed_total: u64,
    pub laps_dnf_total: u64,
    pub commands_total: u64,
    pub sensor_degraded_total: u64,
    pub events_dropped_total: u64,
    pub publish_failures_total: u64,
    pub race_state: u64,
    pub sensor_health: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            avg_tick_us = %self.avg_tick_latency_us,
            max_tick_us = %self.max_tick_latency_us,
            p99_tick_us = %self.tick_lat_p99_us,
            overruns = %self.tick_overruns_total,
            invalid_readings = %self.readings_invalid_total,
            crossings = %self.crossings_total,
            laps = %self.laps_completed_total,
            dnf = %self.laps_dnf_total,
            events_dropped = %self.events_dropped_total,
            "metrics"
        );
    }
}
