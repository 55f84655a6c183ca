//! # Alarm
//!
//! Decides how the buzzer reacts to an intruder alert. The closer the intruder the louder the
//! response:
//!
//! - `Danger` - continuous alarm and the robot is told to stand still
//! - `Close` - continuous alarm
//! - `Far` - a single beep, at most once per cooldown period

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::mcu::BuzzerCmd;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::modes::patrol::Intruder;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Danger,
    Close,
    Far,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlarmParams {
    /// Sound the buzzer at all
    pub enabled: bool,

    /// Intruders at or inside this distance get the continuous alarm (m)
    pub close_distance_m: f64,

    /// Intruders at or inside this distance also stop the robot (m)
    pub danger_distance_m: f64,

    /// Minimum time between two single beeps (s)
    pub beep_cooldown_s: f64,
}

/// What to do in response to one alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmAction {
    pub level: AlertLevel,

    /// Buzzer command to send, if any
    pub buzzer: Option<BuzzerCmd>,

    /// Zero the motion demands immediately
    pub stop_motion: bool,
}

pub struct Alarm {
    params: AlarmParams,
    last_beep_s: Option<f64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for AlarmParams {
    fn default() -> Self {
        Self {
            enabled: true,
            close_distance_m: 2.5,
            danger_distance_m: 1.5,
            beep_cooldown_s: 2.0,
        }
    }
}

impl Alarm {
    pub fn new(params: AlarmParams) -> Self {
        Self {
            params,
            last_beep_s: None,
        }
    }

    pub fn level(&self, distance_m: f64) -> AlertLevel {
        if distance_m <= self.params.danger_distance_m {
            AlertLevel::Danger
        } else if distance_m <= self.params.close_distance_m {
            AlertLevel::Close
        } else {
            AlertLevel::Far
        }
    }

    /// Decide the response to an intruder alert raised at `now_s` (session seconds).
    pub fn on_intruder(&mut self, intruder: &Intruder, now_s: f64) -> AlarmAction {
        let level = self.level(intruder.distance_m);

        warn!(
            "Intruder alert ({:?}): {:.1} m away, confidence {:.0}%",
            level,
            intruder.distance_m,
            intruder.confidence * 100.0
        );

        let buzzer = match (self.params.enabled, level) {
            (false, _) => None,
            (true, AlertLevel::Danger) | (true, AlertLevel::Close) => Some(BuzzerCmd::Alarm),
            (true, AlertLevel::Far) => {
                let cooled = self
                    .last_beep_s
                    .map_or(true, |t| now_s - t > self.params.beep_cooldown_s);

                if cooled {
                    self.last_beep_s = Some(now_s);
                    Some(BuzzerCmd::Beep)
                } else {
                    None
                }
            }
        };

        let stop_motion = level == AlertLevel::Danger;
        if stop_motion {
            warn!("Intruder too close, stopping");
        }

        AlarmAction {
            level,
            buzzer,
            stop_motion,
        }
    }

    /// Silence the buzzer and forget the beep cooldown.
    pub fn reset(&mut self) -> BuzzerCmd {
        self.last_beep_s = None;
        info!("Alarm reset");
        BuzzerCmd::Off
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::per::BBox;

    fn intruder(distance_m: f64) -> Intruder {
        Intruder {
            class_name: String::from("person"),
            confidence: 0.9,
            bbox: BBox::new(0, 0, 100, 100),
            distance_m,
            centre_x: 0.0,
            centre_y: 0.0,
            timestamp_s: 0.0,
        }
    }

    #[test]
    fn test_levels() {
        let mut alarm = Alarm::new(AlarmParams::default());

        let a = alarm.on_intruder(&intruder(1.5), 0.0);
        assert_eq!(a.level, AlertLevel::Danger);
        assert_eq!(a.buzzer, Some(BuzzerCmd::Alarm));
        assert!(a.stop_motion);

        let a = alarm.on_intruder(&intruder(2.5), 0.0);
        assert_eq!(a.level, AlertLevel::Close);
        assert_eq!(a.buzzer, Some(BuzzerCmd::Alarm));
        assert!(!a.stop_motion);

        let a = alarm.on_intruder(&intruder(2.8), 0.0);
        assert_eq!(a.level, AlertLevel::Far);
        assert_eq!(a.buzzer, Some(BuzzerCmd::Beep));
    }

    #[test]
    fn test_beep_cooldown() {
        let mut alarm = Alarm::new(AlarmParams::default());

        assert_eq!(alarm.on_intruder(&intruder(3.0), 10.0).buzzer, Some(BuzzerCmd::Beep));
        assert_eq!(alarm.on_intruder(&intruder(3.0), 11.0).buzzer, None);
        assert_eq!(alarm.on_intruder(&intruder(3.0), 12.0).buzzer, None);
        assert_eq!(alarm.on_intruder(&intruder(3.0), 12.5).buzzer, Some(BuzzerCmd::Beep));

        assert_eq!(alarm.reset(), BuzzerCmd::Off);
        assert_eq!(alarm.on_intruder(&intruder(3.0), 13.0).buzzer, Some(BuzzerCmd::Beep));
    }

    #[test]
    fn test_disabled() {
        let mut alarm = Alarm::new(AlarmParams {
            enabled: false,
            ..Default::default()
        });

        let a = alarm.on_intruder(&intruder(1.0), 0.0);
        assert_eq!(a.buzzer, None);
        assert!(a.stop_motion);
    }
}
