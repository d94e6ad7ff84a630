//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `sampler` - Distance sampler trait plus simulated and replay samplers
//! - `tfmini` - TF-Mini serial frame decoding and the hardware sampler
//! - `telemetry` - Typed telemetry payloads built from race events
//! - `mqtt_publisher` - MQTT publisher for lap, status and health telemetry
//! - `web` - HTTP API for status queries and operator commands
//! - `prometheus` - Prometheus text exposition served at /metrics
//! - `indicator` - Visual indicator driver and backends

pub mod indicator;
pub mod mqtt_publisher;
pub mod prometheus;
pub mod sampler;
pub mod telemetry;
pub mod tfmini;
pub mod web;

// Re-export commonly used types
pub use indicator::{IndicatorBackend, IndicatorDriver, LogBackend};
pub use mqtt_publisher::MqttPublisher;
pub use sampler::{DistanceSampler, ReplaySampler, SimulatedSampler};
pub use tfmini::TfMiniSampler;
pub use web::{start_web_server, ApiState};
