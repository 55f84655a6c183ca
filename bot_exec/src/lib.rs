//! # Bot library.
//!
//! This library allows other crates in the workspace to access items defined inside the bot
//! crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Alarm - buzzer response to intruder alerts
pub mod alarm;

/// Data store - per cycle state of the executable
pub mod data_store;

/// Driver - runs the active mode and forwards its demands
pub mod driver;

/// Modes - the autonomous behaviours (patrol, line following, object tracking)
pub mod modes;

/// Parameters of the executable
pub mod params;

/// UART control - serial link to the chassis microcontroller
pub mod uart_ctrl;
