//! Pumptrack lap timer
//!
//! Times laps on a pumptrack using a distance sensor as a virtual timing gate.
//!
//! Module structure:
//! - `domain/` - Core timing types (Reading, RaceState, LapRecord)
//! - `io/` - External interfaces (sensor, HTTP API, MQTT, indicator)
//! - `services/` - Timing logic (detector, state machine, timing loop)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use pumptrack_timer::infra::{Config, LogFormat, Metrics, SensorKind};
use pumptrack_timer::io::{
    start_web_server, ApiState, DistanceSampler, IndicatorDriver, LogBackend, MqttPublisher,
    SimulatedSampler, TfMiniSampler,
};
use pumptrack_timer::services::{command_channel, status_channel, EventFanout, TimingLoop};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Pumptrack lap timer - distance-sensor timing gate
#[derive(Parser, Debug)]
#[command(name = "pumptrack-timer", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/timer.toml)
    #[arg(short, long)]
    config: Option<String>,
}

const TELEMETRY_QUEUE_CAPACITY: usize = 256;
const INDICATOR_QUEUE_CAPACITY: usize = 64;

fn init_tracing(config: &Config) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    match config.log_format() {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init(),
    }
}

fn build_sampler(config: &Config) -> Box<dyn DistanceSampler> {
    match config.sensor_kind() {
        SensorKind::Tfmini => Box::new(TfMiniSampler::new(config)),
        SensorKind::Simulated => Box::new(SimulatedSampler::new(config.simulated_lap_interval())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()))?;

    init_tracing(&config);
    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "pumptrack-timer starting");

    let timing = config.timing();
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        sensor = ?config.sensor_kind(),
        threshold_cm = %timing.crossing_threshold_cm,
        debounce_ms = %timing.debounce.as_millis(),
        dnf_timeout_ms = %timing.dnf_timeout.as_millis(),
        reset_delay_ms = %timing.reset_delay.as_millis(),
        sample_interval_ms = %timing.sample_interval.as_millis(),
        web_port = %config.web_port(),
        mqtt_enabled = %config.mqtt_enabled(),
        "config_loaded"
    );

    // Start embedded MQTT broker (if enabled)
    pumptrack_timer::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let session_id: Arc<str> = Arc::from(uuid::Uuid::now_v7().to_string());
    let site_id: Arc<str> = Arc::from(config.site_id());

    let (commands, command_rx) = command_channel();
    let (publisher, store) = status_channel(Arc::clone(&session_id));

    let mut fanout = EventFanout::new(metrics.clone());
    let telemetry_rx = config
        .mqtt_enabled()
        .then(|| fanout.subscribe("telemetry", TELEMETRY_QUEUE_CAPACITY));
    let indicator_rx = config
        .indicator_enabled()
        .then(|| fanout.subscribe("indicator", INDICATOR_QUEUE_CAPACITY));

    // HTTP API
    let api_state = ApiState {
        store: store.clone(),
        commands,
        metrics: metrics.clone(),
        site_id: Arc::clone(&site_id),
    };
    let web_bind = config.web_bind_address().to_string();
    let web_port = config.web_port();
    let web_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_web_server(&web_bind, web_port, api_state, web_shutdown).await {
            error!(error = ?e, "web_server_error");
        }
    });

    // MQTT telemetry publisher
    if let Some(events) = telemetry_rx {
        let mqtt_publisher = MqttPublisher::new(&config, events, store.clone(), metrics.clone());
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            mqtt_publisher.run(mqtt_shutdown).await;
        });
    }

    // Visual indicator
    if let Some(events) = indicator_rx {
        let driver = IndicatorDriver::new(LogBackend, events);
        let indicator_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            driver.run(indicator_shutdown).await;
        });
    }

    // Metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Timing loop on its own thread and runtime, isolated from IO tasks
    let timing_loop = TimingLoop::new(
        timing,
        build_sampler(&config),
        command_rx,
        publisher,
        fanout,
        session_id,
        metrics,
    );
    let timing_shutdown = shutdown_rx.clone();
    let timing_thread = thread::Builder::new().name("timing-loop".to_string()).spawn(move || {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(timing_loop.run(timing_shutdown)),
            Err(e) => error!(error = %e, "timing_runtime_build_failed"),
        }
    })?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    if tokio::task::spawn_blocking(move || timing_thread.join()).await?.is_err() {
        error!("timing_loop_panicked");
    }

    info!("pumptrack-timer shutdown complete");
    Ok(())
}
