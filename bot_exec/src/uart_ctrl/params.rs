//! # UartCtrl parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;
use std::time::Duration;
use util::time::seconds_to_std;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the serial protocol controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UartCtrlParams {
    /// Serial device path
    pub port: String,

    pub baud_rate: u32,

    /// Timeout of a single blocking read on the serial port (s)
    pub read_timeout_s: f64,

    /// Maximum rate at which queued commands are transmitted (Hz)
    pub command_rate_hz: f64,

    /// Leg height sent after arming (m)
    pub leg_height_m: f64,

    /// Period between heartbeat requests (s)
    pub heartbeat_interval_s: f64,

    /// Time without a confirmed response before the link may be declared lost (s)
    pub heartbeat_timeout_s: f64,

    /// Number of consecutive unanswered heartbeats before the link may be declared lost
    pub max_missed_heartbeats: u32,

    /// How long the watchdog waits for a reply to each heartbeat (s)
    pub heartbeat_read_timeout_s: f64,

    /// Only count recognised replies (`!`, `OK`, `ERR`, telemetry) as heartbeat acknowledgements.
    ///
    /// When false any non-empty line confirms the link.
    pub strict_heartbeat_ack: bool,

    /// Delay before the first arm attempt (s)
    pub enable_settle_s: f64,

    /// Number of attempts to send the arm command
    pub enable_retries: u32,

    /// Pause after a successful arm attempt (s)
    pub enable_pacing_s: f64,

    /// Pause after a failed arm attempt (s)
    pub enable_retry_delay_s: f64,

    /// Sleep of the receiver when there are no bytes waiting (s)
    pub receive_idle_sleep_s: f64,

    /// Maximum time to wait for each worker when disconnecting (s)
    pub worker_join_timeout_s: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for UartCtrlParams {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyACM0"),
            baud_rate: 115200,
            read_timeout_s: 0.1,
            command_rate_hz: 10.0,
            leg_height_m: 0.15,
            heartbeat_interval_s: 0.5,
            heartbeat_timeout_s: 1.5,
            max_missed_heartbeats: 3,
            heartbeat_read_timeout_s: 0.1,
            strict_heartbeat_ack: false,
            enable_settle_s: 0.1,
            enable_retries: 3,
            enable_pacing_s: 0.05,
            enable_retry_delay_s: 0.1,
            receive_idle_sleep_s: 0.005,
            worker_join_timeout_s: 1.0,
        }
    }
}

impl UartCtrlParams {
    /// Check the parameters are usable, returning a description of the first problem found.
    pub fn are_valid(&self) -> Result<(), String> {
        if self.port.is_empty() {
            return Err("port must not be empty".into());
        }
        if self.baud_rate == 0 {
            return Err("baud_rate must be positive".into());
        }
        if !(self.command_rate_hz > 0.0) {
            return Err(format!("command_rate_hz must be positive, found {}", self.command_rate_hz));
        }
        if !(self.heartbeat_interval_s > 0.0) {
            return Err(format!(
                "heartbeat_interval_s must be positive, found {}",
                self.heartbeat_interval_s
            ));
        }
        if self.heartbeat_timeout_s < self.heartbeat_interval_s {
            return Err(format!(
                "heartbeat_timeout_s ({}) must not be less than heartbeat_interval_s ({})",
                self.heartbeat_timeout_s, self.heartbeat_interval_s
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err("max_missed_heartbeats must be at least 1".into());
        }
        if self.enable_retries == 0 {
            return Err("enable_retries must be at least 1".into());
        }
        Ok(())
    }

    /// Minimum spacing between two transmitted queue entries.
    pub fn command_period(&self) -> Duration {
        seconds_to_std(1.0 / self.command_rate_hz)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        seconds_to_std(self.heartbeat_interval_s)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        seconds_to_std(self.heartbeat_timeout_s)
    }

    pub fn heartbeat_read_timeout(&self) -> Duration {
        seconds_to_std(self.heartbeat_read_timeout_s)
    }

    pub fn read_timeout(&self) -> Duration {
        seconds_to_std(self.read_timeout_s)
    }

    pub fn receive_idle_sleep(&self) -> Duration {
        seconds_to_std(self.receive_idle_sleep_s)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        seconds_to_std(self.worker_join_timeout_s)
    }
}
