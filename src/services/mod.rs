//! Services - timing logic and state distribution
//!
//! This module contains the core timing services:
//! - `detector` - Crossing detection with hysteresis, debounce and sensor health
//! - `race_machine` - Race state machine and lap recording
//! - `engine` - Per-reading pipeline combining detector and state machine
//! - `timing_loop` - Fixed-cadence loop, the single writer of race state
//! - `status_store` - Copy-on-write snapshots for concurrent readers
//! - `fanout` - Non-blocking race event fan-out to subscribers

pub mod detector;
pub mod engine;
pub mod fanout;
pub mod race_machine;
pub mod status_store;
pub mod timing_loop;

// Re-export commonly used types
pub use engine::TimingEngine;
pub use fanout::EventFanout;
pub use status_store::{status_channel, RaceSnapshot, StatusPublisher, StatusStore};
pub use timing_loop::{command_channel, CommandError, CommandSender, TimingLoop};
