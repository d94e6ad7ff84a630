//! Domain models - core timing types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Reading` / `CrossingEvent` - sensor samples and debounced gate crossings
//! - `RaceState` / `RaceEvent` - race state machine states and lifecycle events
//! - `LapRecord` / `LapHistory` / `SessionStats` - finished attempts and aggregates

pub mod lap;
pub mod race;
pub mod types;

pub use lap::{LapHistory, LapOutcome, LapRecord, SessionStats};
pub use race::{RaceEvent, RaceState, RaceStateTag};
pub use types::{CrossingEvent, RaceCommand, Reading, SensorHealth};
