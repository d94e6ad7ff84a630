//! Infrastructure - configuration, metrics, and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, validation, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Optional embedded MQTT broker (rumqttd)

pub mod broker;
pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, LogFormat, SensorKind, TimingParams};
pub use metrics::Metrics;
