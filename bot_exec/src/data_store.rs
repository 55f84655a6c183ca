//! # Data Store

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::RobotFeedback;
use log::{info, warn};

use crate::modes::ModeOutput;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Gives the reason the robot has been put into safe mode
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SafeModeCause {
    /// The serial link to the microcontroller is not open
    UartNotConnected,

    /// The link is open but motor control is disabled, usually after a heartbeat loss
    ControlDisabled,

    /// An emergency stop was sent
    EmergencyStop,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Global data store for the executable.
#[derive(Default)]
pub struct DataStore {
    // Cycle management
    /// Number of cycles already executed
    pub num_cycles: u128,

    /// True if this cycle falls on a 1Hz boundary
    pub is_1_hz_cycle: bool,

    /// Session elapsed time at the start of this cycle
    pub session_time_s: f64,

    // Safe mode variables
    /// Determines if the robot is in safe mode.
    pub safe: bool,

    /// Gives the reason for the robot being in safe mode.
    pub safe_cause: Option<SafeModeCause>,

    // Modes
    pub mode_output: Option<ModeOutput>,

    pub feedback: Option<RobotFeedback>,

    // Monitoring Counters
    /// Number of consecutive cycle overruns
    pub num_consec_cycle_overruns: u64,

    /// Number of frames given to the active mode
    pub num_frames: u64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl DataStore {
    /// Puts the robot into safe mode with the given cause.
    pub fn make_safe(&mut self, cause: SafeModeCause) {
        if !self.safe {
            warn!("Make safe requested, cause: {:?}", cause);
            self.safe = true;
            self.safe_cause = Some(cause);
        }
    }

    /// Attempts to disable the safe mode by clearing the given cause.
    ///
    /// Returns `Ok(())` if this cause was cleared and safe mode was disabled, or `Err(())`
    /// otherwise. To remove safe mode the provided cause must match the initial reason for safe
    /// mode being enabled.
    ///
    /// If safe mode was not enabled `Ok(())` is returned
    pub fn make_unsafe(&mut self, cause: SafeModeCause) -> Result<(), ()> {
        if !self.safe {
            return Ok(());
        }

        match self.safe_cause {
            Some(root_cause) if root_cause == cause => {
                self.safe = false;
                self.safe_cause = None;
                info!("Make unsafe requested, root cause match, safe mode disabled");
                Ok(())
            }
            Some(_) => Err(()),
            None => Ok(()),
        }
    }

    /// Perform actions required at the start of a cycle.
    ///
    /// Clears those items that need clearing at the start of a cycle, and sets the 1Hz cycle flag.
    pub fn cycle_start(&mut self, cycle_frequency_hz: f64) {
        let cycles_per_s = (cycle_frequency_hz as u128).max(1);
        self.is_1_hz_cycle = self.num_cycles % cycles_per_s == 0;

        self.mode_output = None;
        self.feedback = None;

        if let Some(t) = util::session::elapsed_seconds() {
            self.session_time_s = t;
        }
    }

    /// Perform actions required at the end of a cycle.
    pub fn cycle_end(&mut self) {
        self.num_cycles += 1;
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
