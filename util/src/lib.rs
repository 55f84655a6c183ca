//! Utility library for the patrol robot software

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod host;
#[macro_use]
pub mod logger;
pub mod maths;
pub mod params;
pub mod session;
pub mod script_interpreter;
pub mod time;

// ---------------------------------------------------------------------------
// REEXPORTS
// ---------------------------------------------------------------------------

pub use comms_if;
