//! Integration tests for configuration loading

use pumptrack_timer::infra::{Config, LogFormat, SensorKind};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "north-track"

[timing]
crossing_threshold_cm = 50.0
hysteresis_cm = 5.0
debounce_ms = 2000
dnf_timeout_ms = 45000
reset_delay_ms = 5000
minimum_lap_time_ms = 3000
sample_interval_ms = 10
sensor_timeout_ms = 500

[sensor]
kind = "simulated"
simulated_lap_secs = 15.0

[web]
port = 9090

[mqtt]
host = "test-host"
port = 1884
lap_topic = "track/north/lap"

[logging]
level = "debug"
format = "json"
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "north-track");
    let timing = config.timing();
    assert_eq!(timing.crossing_threshold_cm, 50.0);
    assert_eq!(timing.hysteresis_cm, 5.0);
    assert_eq!(timing.debounce, Duration::from_secs(2));
    assert_eq!(timing.dnf_timeout, Duration::from_secs(45));
    assert_eq!(timing.minimum_lap_time, Duration::from_secs(3));
    assert_eq!(config.sensor_kind(), SensorKind::Simulated);
    assert_eq!(config.simulated_lap_interval(), Duration::from_secs(15));
    assert_eq!(config.web_port(), 9090);
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_lap_topic(), "track/north/lap");
    assert_eq!(config.mqtt_dnf_topic(), "pumptrack/dnf");
    assert_eq!(config.log_level(), "debug");
    assert_eq!(config.log_format(), LogFormat::Json);
}

#[test]
fn test_invalid_values_are_rejected() {
    let temp_file = write_config(
        r#"
[timing]
crossing_threshold_cm = 500.0
"#,
    );

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("crossing_threshold_cm"));
}

#[test]
fn test_zero_metrics_interval_is_rejected() {
    let temp_file = write_config("[metrics]\ninterval_secs = 0\n");

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("interval_secs"));
}

#[test]
fn test_load_from_path_fails_on_bad_file() {
    let temp_file = write_config("[timing\ncrossing_threshold_cm = ");
    let path = temp_file.path().to_str().unwrap().to_string();
    assert!(Config::load_from_path(&path).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/timer.toml").unwrap();
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.web_port(), 8080);
    assert_eq!(config.timing().dnf_timeout, Duration::from_secs(60));
}

#[test]
fn test_sample_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/timer.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.timing().sample_interval, Duration::from_millis(10));
}
