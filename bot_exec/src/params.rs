//! # Bot Executable Parameters
//!
//! This module provide parameters for the bot executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;
use std::time::Duration;
use util::time::seconds_to_std;

use crate::alarm::AlarmParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotExecParams {
    /// Target period of one control cycle (s)
    pub cycle_period_s: f64,

    /// Mode run when none is given on the command line
    pub default_mode: String,

    /// Directory, relative to the working directory, in which sessions are created
    pub sessions_dir: String,

    /// Size of the empty frames given to the mode when no perception script is loaded (px)
    pub blind_frame_width: u32,
    pub blind_frame_height: u32,

    /// Consecutive cycle overruns tolerated before the exec gives up
    pub max_consec_cycle_overruns: u64,

    pub alarm: AlarmParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for BotExecParams {
    fn default() -> Self {
        Self {
            cycle_period_s: 0.05,
            default_mode: String::from("patrol"),
            sessions_dir: String::from("sessions"),
            blind_frame_width: 640,
            blind_frame_height: 480,
            max_consec_cycle_overruns: 500,
            alarm: AlarmParams::default(),
        }
    }
}

impl BotExecParams {
    pub fn are_valid(&self) -> Result<(), String> {
        if !(self.cycle_period_s > 0.0) {
            return Err(format!(
                "cycle_period_s must be positive, got {}",
                self.cycle_period_s
            ));
        }

        if self.alarm.danger_distance_m > self.alarm.close_distance_m {
            return Err(String::from(
                "alarm.danger_distance_m cannot be beyond alarm.close_distance_m",
            ));
        }

        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        seconds_to_std(self.cycle_period_s)
    }

    pub fn cycle_frequency_hz(&self) -> f64 {
        1.0 / self.cycle_period_s
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_params() {
        let p: BotExecParams =
            toml::from_str("cycle_period_s = 0.1\n[alarm]\nbeep_cooldown_s = 5.0\n").unwrap();

        assert!(p.are_valid().is_ok());
        assert!((p.cycle_period().as_secs_f64() - 0.1).abs() < 1e-6);
        assert!((p.cycle_frequency_hz() - 10.0).abs() < 1e-9);
        assert_eq!(p.alarm.beep_cooldown_s, 5.0);
        assert_eq!(p.alarm.close_distance_m, 2.5);

        let bad = BotExecParams {
            cycle_period_s: 0.0,
            ..Default::default()
        };
        assert!(bad.are_valid().is_err());
    }
}
