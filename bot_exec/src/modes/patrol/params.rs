//! # Patrol mode parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;

use crate::modes::MotionLimits;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the patrol mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatrolParams {
    pub limits: MotionLimits,

    /// Forward speed while patrolling (m/s)
    pub patrol_velocity_ms: f64,

    /// Yaw rate magnitude while rotating and returning (rad/s)
    pub rotate_yaw_rate_rads: f64,

    /// Time spent driving forward in each patrol leg (s)
    pub forward_time_s: f64,

    /// Time spent rotating between patrol legs (s)
    pub rotate_time_s: f64,

    /// Object class treated as an intruder
    pub detect_class: String,

    pub min_confidence: f64,

    /// Minimum bounding box area of an intruder (px^2)
    pub min_box_area: i64,

    /// Intruders further away than this are ignored (m)
    pub alert_distance_m: f64,

    /// How long to hold still in the alert state (s)
    pub alert_duration_s: f64,

    /// Time in the alert state before tracking may begin (s)
    pub alert_to_track_delay_s: f64,

    /// Follow intruders after an alert
    pub track_intruder: bool,

    /// Distance to hold from a tracked intruder (m)
    pub tracking_distance_m: f64,

    /// Yaw rate per unit of normalised horizontal error
    pub tracking_gain: f64,

    /// Distance error inside which the robot holds position while tracking (m)
    pub tracking_deadband_m: f64,

    /// Speed per metre of distance error when approaching
    pub approach_gain: f64,

    /// Speed per metre of distance error when backing off
    pub backoff_gain: f64,

    /// Fastest reverse speed while tracking (m/s)
    pub max_backoff_ms: f64,

    /// Maximum time spent tracking before returning to patrol (s)
    pub max_track_time_s: f64,

    /// Time spent turning away before resuming patrol (s)
    pub return_time_s: f64,

    /// Keep only this many intruders in the history, unbounded if not set
    pub intruder_history_limit: Option<usize>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for PatrolParams {
    fn default() -> Self {
        Self {
            limits: MotionLimits::default(),
            patrol_velocity_ms: 0.3,
            rotate_yaw_rate_rads: 0.5,
            forward_time_s: 5.0,
            rotate_time_s: 3.0,
            detect_class: String::from("person"),
            min_confidence: 0.5,
            min_box_area: 3000,
            alert_distance_m: 3.0,
            alert_duration_s: 3.0,
            alert_to_track_delay_s: 1.0,
            track_intruder: true,
            tracking_distance_m: 2.0,
            tracking_gain: 1.5,
            tracking_deadband_m: 0.3,
            approach_gain: 0.5,
            backoff_gain: 0.3,
            max_backoff_ms: 0.2,
            max_track_time_s: 10.0,
            return_time_s: 2.0,
            intruder_history_limit: None,
        }
    }
}

impl PatrolParams {
    /// Check the parameters describe a usable patrol.
    pub fn are_valid(&self) -> Result<(), String> {
        let positive = [
            ("forward_time_s", self.forward_time_s),
            ("rotate_time_s", self.rotate_time_s),
            ("alert_duration_s", self.alert_duration_s),
            ("max_track_time_s", self.max_track_time_s),
            ("return_time_s", self.return_time_s),
            ("alert_distance_m", self.alert_distance_m),
        ];

        for (name, value) in positive.iter() {
            if !(*value > 0.0) {
                return Err(format!("patrol.{} must be positive, got {}", name, value));
            }
        }

        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!(
                "patrol.min_confidence must be in [0, 1], got {}",
                self.min_confidence
            ));
        }

        if self.max_backoff_ms < 0.0 {
            return Err(String::from("patrol.max_backoff_ms cannot be negative"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(PatrolParams::default().are_valid().is_ok());

        let p = PatrolParams {
            rotate_time_s: 0.0,
            ..Default::default()
        };
        assert!(p.are_valid().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let p: PatrolParams =
            toml::from_str("forward_time_s = 2.5\n[limits]\nmax_yaw_rate_rads = 1.0\n").unwrap();

        assert_eq!(p.forward_time_s, 2.5);
        assert_eq!(p.limits.max_yaw_rate_rads, 1.0);
        assert_eq!(p.limits.max_velocity_ms, 2.0);
        assert_eq!(p.detect_class, "person");
    }
}
