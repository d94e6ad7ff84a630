//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/timer.toml
//!
//! Values are validated once at startup and are immutable for the lifetime
//! of the timing loop.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/timer.toml";

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Benewake TF-Mini LiDAR over UART
    Tfmini,
    /// Synthetic rider passes, no hardware
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Site identifier included in telemetry payloads
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "pumptrack".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub crossing_threshold_cm: f64,
    /// Extra distance above the threshold needed to leave the detection zone
    pub hysteresis_cm: f64,
    pub debounce_ms: u64,
    pub dnf_timeout_ms: u64,
    pub reset_delay_ms: u64,
    pub minimum_lap_time_ms: u64,
    pub sample_interval_ms: u64,
    pub sensor_timeout_ms: u64,
    /// Minimum interval between routine status snapshots
    pub snapshot_interval_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            crossing_threshold_cm: 100.0,
            hysteresis_cm: 0.0,
            debounce_ms: 200,
            dnf_timeout_ms: 60_000,
            reset_delay_ms: 5_000,
            minimum_lap_time_ms: 1_000,
            sample_interval_ms: 10,
            sensor_timeout_ms: 500,
            snapshot_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub kind: SensorKind,
    pub device: String,
    pub baud: u32,
    /// Upper bound for one serial read inside a tick
    pub read_timeout_ms: u64,
    /// Readings below this signal strength are invalid
    pub min_strength: u16,
    pub max_distance_cm: f64,
    /// Seconds between synthetic passes (simulated sensor only)
    pub simulated_lap_secs: f64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            kind: SensorKind::Tfmini,
            device: "/dev/serial0".to_string(),
            baud: 115_200,
            read_timeout_ms: 5,
            min_strength: 100,
            max_distance_cm: 1200.0,
            simulated_lap_secs: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind_address: String,
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Interval for periodic status/statistics/health publishing
    pub publish_interval_ms: u64,
    pub lap_topic: String,
    pub dnf_topic: String,
    pub status_topic: String,
    pub stats_topic: String,
    pub health_topic: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "pumptrack_timer".to_string(),
            username: None,
            password: None,
            publish_interval_ms: 2_000,
            lap_topic: "pumptrack/lap".to_string(),
            dnf_topic: "pumptrack/dnf".to_string(),
            status_topic: "pumptrack/status".to_string(),
            stats_topic: "pumptrack/stats".to_string(),
            health_topic: "pumptrack/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self { enabled: false, bind_address: "0.0.0.0".to_string(), port: 1883 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndicatorSection {
    pub enabled: bool,
}

impl Default for IndicatorSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub timing: TimingSection,
    pub sensor: SensorSection,
    pub web: WebSection,
    pub mqtt: MqttSection,
    pub broker: BrokerSection,
    pub indicator: IndicatorSection,
    pub metrics: MetricsSection,
    pub logging: LoggingSection,
}

/// Validated timing parameters handed to the timing loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingParams {
    pub crossing_threshold_cm: f64,
    pub hysteresis_cm: f64,
    pub debounce: Duration,
    pub dnf_timeout: Duration,
    pub reset_delay: Duration,
    pub minimum_lap_time: Duration,
    pub sample_interval: Duration,
    pub sensor_timeout: Duration,
    pub snapshot_interval: Duration,
}

impl Default for TimingParams {
    fn default() -> Self {
        TimingParams::from(&TimingSection::default())
    }
}

impl From<&TimingSection> for TimingParams {
    fn from(t: &TimingSection) -> Self {
        Self {
            crossing_threshold_cm: t.crossing_threshold_cm,
            hysteresis_cm: t.hysteresis_cm,
            debounce: Duration::from_millis(t.debounce_ms),
            dnf_timeout: Duration::from_millis(t.dnf_timeout_ms),
            reset_delay: Duration::from_millis(t.reset_delay_ms),
            minimum_lap_time: Duration::from_millis(t.minimum_lap_time_ms),
            sample_interval: Duration::from_millis(t.sample_interval_ms),
            sensor_timeout: Duration::from_millis(t.sensor_timeout_ms),
            snapshot_interval: Duration::from_millis(t.snapshot_interval_ms),
        }
    }
}

impl TimingParams {
    /// Check ranges once at startup
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(10.0..=200.0).contains(&self.crossing_threshold_cm) {
            bail!(
                "crossing_threshold_cm must be 10-200 cm, got {}",
                self.crossing_threshold_cm
            );
        }
        if self.hysteresis_cm < 0.0 {
            bail!("hysteresis_cm must not be negative, got {}", self.hysteresis_cm);
        }
        if self.debounce < Duration::from_millis(50) || self.debounce > Duration::from_secs(10) {
            bail!("debounce_ms must be 50-10000 ms, got {:?}", self.debounce);
        }
        if self.dnf_timeout < Duration::from_secs(10) || self.dnf_timeout > Duration::from_secs(300)
        {
            bail!("dnf_timeout_ms must be 10-300 s, got {:?}", self.dnf_timeout);
        }
        if self.minimum_lap_time >= self.dnf_timeout {
            bail!(
                "minimum_lap_time_ms ({:?}) must be below dnf_timeout_ms ({:?})",
                self.minimum_lap_time,
                self.dnf_timeout
            );
        }
        if self.sample_interval.is_zero() || self.sample_interval > Duration::from_secs(1) {
            bail!("sample_interval_ms must be 1-1000 ms, got {:?}", self.sample_interval);
        }
        if self.sensor_timeout <= self.sample_interval {
            bail!(
                "sensor_timeout_ms ({:?}) must exceed sample_interval_ms ({:?})",
                self.sensor_timeout,
                self.sample_interval
            );
        }
        Ok(())
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    timing: TimingParams,
    sensor: SensorSection,
    web: WebSection,
    mqtt: MqttSection,
    broker: BrokerSection,
    indicator_enabled: bool,
    metrics_interval_secs: u64,
    logging: LoggingSection,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            timing: TimingParams::from(&toml_config.timing),
            sensor: toml_config.sensor,
            web: toml_config.web,
            mqtt: toml_config.mqtt,
            broker: toml_config.broker,
            indicator_enabled: toml_config.indicator.enabled,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            logging: toml_config.logging,
            config_file,
        }
    }

    /// Determine config file path from the CLI argument or environment
    pub fn resolve_config_path(arg: Option<&str>) -> String {
        if let Some(path) = arg {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration - a missing file falls back to defaults, a file
    /// that exists but fails to parse or validate is an error
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            eprintln!("Warning: config file {} not found. Using defaults.", path);
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.timing.validate()?;
        if self.sensor.kind == SensorKind::Simulated && self.sensor.simulated_lap_secs <= 0.0 {
            bail!("simulated_lap_secs must be positive");
        }
        if self.mqtt.enabled && self.mqtt.publish_interval_ms == 0 {
            bail!("mqtt publish_interval_ms must be positive");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics interval_secs must be positive");
        }
        Ok(())
    }

    // Getters
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn timing(&self) -> TimingParams {
        self.timing
    }

    pub fn sensor_kind(&self) -> SensorKind {
        self.sensor.kind
    }

    pub fn sensor_device(&self) -> &str {
        &self.sensor.device
    }

    pub fn sensor_baud(&self) -> u32 {
        self.sensor.baud
    }

    pub fn sensor_read_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor.read_timeout_ms)
    }

    pub fn sensor_min_strength(&self) -> u16 {
        self.sensor.min_strength
    }

    pub fn sensor_max_distance_cm(&self) -> f64 {
        self.sensor.max_distance_cm
    }

    pub fn simulated_lap_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sensor.simulated_lap_secs.max(0.0))
    }

    pub fn web_bind_address(&self) -> &str {
        &self.web.bind_address
    }

    pub fn web_port(&self) -> u16 {
        self.web.port
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt.enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn mqtt_publish_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt.publish_interval_ms)
    }

    pub fn mqtt_lap_topic(&self) -> &str {
        &self.mqtt.lap_topic
    }

    pub fn mqtt_dnf_topic(&self) -> &str {
        &self.mqtt.dnf_topic
    }

    pub fn mqtt_status_topic(&self) -> &str {
        &self.mqtt.status_topic
    }

    pub fn mqtt_stats_topic(&self) -> &str {
        &self.mqtt.stats_topic
    }

    pub fn mqtt_health_topic(&self) -> &str {
        &self.mqtt.health_topic
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker.enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker.bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker.port
    }

    pub fn indicator_enabled(&self) -> bool {
        self.indicator_enabled
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn log_level(&self) -> &str {
        &self.logging.level
    }

    pub fn log_format(&self) -> LogFormat {
        self.logging.format
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to override timing parameters
    #[cfg(test)]
    pub fn with_timing(mut self, timing: TimingParams) -> Self {
        self.timing = timing;
        self
    }
}
