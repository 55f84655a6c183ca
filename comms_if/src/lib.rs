//! # Communications interface crate.
//!
//! Provides all common communications interfaces for the software.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Serial protocol spoken with the chassis microcontroller
pub mod mcu;

/// Perception data consumed by the autonomous modes
pub mod per;
