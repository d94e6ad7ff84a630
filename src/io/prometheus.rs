//! Prometheus text exposition for timer metrics
//!
//! Served at GET /metrics by the web API.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::status_store::RaceSnapshot;
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a gauge metric with f64 value
fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.6}");
}

/// Write a histogram from per-bucket counts, with an exact sum
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics and session gauges in Prometheus text format
pub fn format_prometheus_metrics(
    summary: &MetricsSummary,
    snapshot: &RaceSnapshot,
    site_id: &str,
) -> String {
    let mut output = String::with_capacity(4096);

    write_loop_metrics(&mut output, site_id, summary);
    write_sensor_metrics(&mut output, site_id, summary);
    write_race_metrics(&mut output, site_id, summary, snapshot);
    write_delivery_metrics(&mut output, site_id, summary);

    output
}

fn write_loop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pumptrack_ticks_total",
        "Timing loop ticks",
        MetricType::Counter,
        site,
        summary.ticks_total,
    );
    write_histogram(
        output,
        "pumptrack_tick_latency_us",
        "Timing loop tick latency in microseconds",
        site,
        &summary.tick_lat_buckets,
        summary.tick_latency_total_us,
    );
    write_metric(
        output,
        "pumptrack_tick_latency_p99_us",
        "99th percentile tick latency",
        MetricType::Gauge,
        site,
        summary.tick_lat_p99_us,
    );
    write_metric(
        output,
        "pumptrack_tick_overruns_total",
        "Ticks that took longer than the sample interval",
        MetricType::Counter,
        site,
        summary.tick_overruns_total,
    );
    write_metric(
        output,
        "pumptrack_clock_anomalies_total",
        "Readings discarded because time went backwards",
        MetricType::Counter,
        site,
        summary.clock_anomalies_total,
    );
}

fn write_sensor_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pumptrack_sensor_health",
        "Sensor health (0=unknown, 1=healthy, 2=degraded)",
        MetricType::Gauge,
        site,
        summary.sensor_health,
    );
    write_metric(
        output,
        "pumptrack_sensor_degraded_total",
        "Transitions into degraded sensor health",
        MetricType::Counter,
        site,
        summary.sensor_degraded_total,
    );
    write_metric(
        output,
        "pumptrack_readings_invalid_total",
        "Invalid sensor readings",
        MetricType::Counter,
        site,
        summary.readings_invalid_total,
    );
    write_metric(
        output,
        "pumptrack_crossings_total",
        "Gate crossings emitted",
        MetricType::Counter,
        site,
        summary.crossings_total,
    );
    write_metric(
        output,
        "pumptrack_crossings_debounced_total",
        "Gate entries suppressed by debounce",
        MetricType::Counter,
        site,
        summary.crossings_debounced_total,
    );
}

fn write_race_metrics(
    output: &mut String,
    site: &str,
    summary: &MetricsSummary,
    snapshot: &RaceSnapshot,
) {
    write_metric(
        output,
        "pumptrack_race_state",
        "Race state (0=idle, 1=ready, 2=timing, 3=completed, 4=dnf, 5=reset_countdown)",
        MetricType::Gauge,
        site,
        summary.race_state,
    );
    write_metric(
        output,
        "pumptrack_laps_completed_total",
        "Completed laps",
        MetricType::Counter,
        site,
        summary.laps_completed_total,
    );
    write_metric(
        output,
        "pumptrack_laps_dnf_total",
        "Laps that timed out",
        MetricType::Counter,
        site,
        summary.laps_dnf_total,
    );
    write_metric(
        output,
        "pumptrack_short_laps_rejected_total",
        "Crossings ignored as shorter than the minimum lap",
        MetricType::Counter,
        site,
        summary.short_laps_rejected_total,
    );
    write_metric(
        output,
        "pumptrack_commands_total",
        "Operator commands processed",
        MetricType::Counter,
        site,
        summary.commands_total,
    );

    let stats = snapshot.stats();
    if let Some(best) = stats.best {
        write_gauge_f64(output, "pumptrack_best_lap_seconds", "Fastest lap", site, best);
    }
    if let Some(average) = stats.average {
        write_gauge_f64(output, "pumptrack_average_lap_seconds", "Average lap", site, average);
    }
    write_gauge_f64(
        output,
        "pumptrack_completion_rate_pct",
        "Completed laps over attempts",
        site,
        stats.completion_rate,
    );
}

fn write_delivery_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pumptrack_events_dropped_total",
        "Race events dropped because a subscriber queue was full",
        MetricType::Counter,
        site,
        summary.events_dropped_total,
    );
    write_metric(
        output,
        "pumptrack_publish_failures_total",
        "Telemetry publishes rejected by the MQTT client",
        MetricType::Counter,
        site,
        summary.publish_failures_total,
    );
}
