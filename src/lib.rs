//! Q-learning throttle controller for a slot car.
//!
//! The agent learns, per discretized state (next track feature, distance to it, speed),
//! which throttle setting maximizes a running reward of speed and laps without deslotting.

pub mod actuator;
pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod sensors;
pub mod sim;
pub mod space;
pub mod table;
pub mod track;

pub use error::{Result, SlotCarError};
