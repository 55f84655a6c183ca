//! # Patrol mode
//!
//! Security patrol behaviour. The robot drives forward for a fixed time then rotates on the spot,
//! alternating the direction of rotation on each leg. If an intruder is seen it stops, raises an
//! alert, and optionally tracks the intruder before turning away and resuming the patrol.
//!
//! All timers run on the frame timestamp, so the automaton is deterministic for a given sequence
//! of frames.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod intruder;
mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    mcu::RobotFeedback,
    per::{DepthFrame, Frame},
};
use log::{info, warn};
use serde::Serialize;
use std::fmt::{self, Display};

use super::{Mode, ModeCore, ModeOutput, ModeState, Overlay, OverlayBox};

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use intruder::{select_intruder, Intruder, IntruderHistory};
pub use params::PatrolParams;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Called once each time an intruder raises an alert.
pub type AlertCallback = Box<dyn FnMut(&Intruder) + Send>;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Sub-state of the patrol automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PatrolState {
    /// Driving forward along the current leg
    Patrolling,

    /// Turning on the spot between legs
    Rotating,

    /// Intruder seen, holding still
    Alert,

    /// Following an intruder
    Tracking,

    /// Turning away from the intruder before resuming the patrol
    Returning,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct PatrolMode {
    core: ModeCore,
    params: PatrolParams,

    patrol_state: PatrolState,

    /// Frame time at which the current sub-state began, set by the first frame after a (re)start
    state_start_s: Option<f64>,

    /// Number of completed forward legs
    cycle: u32,

    current_intruder: Option<Intruder>,
    history: IntruderHistory,

    alert_start_s: f64,
    track_start_s: f64,

    alert_callback: Option<AlertCallback>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PatrolMode {
    pub fn new(params: PatrolParams) -> Self {
        let history = IntruderHistory::new(params.intruder_history_limit);

        Self {
            core: ModeCore::new("Patrol", params.limits),
            params,
            patrol_state: PatrolState::Patrolling,
            state_start_s: None,
            cycle: 0,
            current_intruder: None,
            history,
            alert_start_s: 0.0,
            track_start_s: 0.0,
            alert_callback: None,
        }
    }

    /// Set the function called whenever an intruder raises an alert.
    pub fn set_alert_callback(&mut self, callback: AlertCallback) {
        self.alert_callback = Some(callback);
    }

    pub fn params(&self) -> &PatrolParams {
        &self.params
    }

    pub fn patrol_state(&self) -> PatrolState {
        self.patrol_state
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn current_intruder(&self) -> Option<&Intruder> {
        self.current_intruder.as_ref()
    }

    /// Every intruder that raised an alert since the last reset, oldest first.
    pub fn intruder_history(&self) -> Vec<Intruder> {
        self.history.to_vec()
    }

    pub fn num_intruders(&self) -> usize {
        self.history.len()
    }

    fn set_patrol_state(&mut self, state: PatrolState, now_s: f64) {
        if state != self.patrol_state {
            info!("Patrol: {} -> {}", self.patrol_state, state);
        }
        self.patrol_state = state;
        self.state_start_s = Some(now_s);
    }

    fn state_elapsed(&self, now_s: f64) -> f64 {
        now_s - self.state_start_s.unwrap_or(now_s)
    }

    fn trigger_alert(&mut self, intruder: Intruder, now_s: f64) {
        warn!(
            "INTRUDER ALERT: {} at {:.2} m (confidence {:.2})",
            intruder.class_name, intruder.distance_m, intruder.confidence
        );

        self.set_patrol_state(PatrolState::Alert, now_s);
        self.alert_start_s = now_s;

        self.history.push(intruder.clone());

        if let Some(cb) = self.alert_callback.as_mut() {
            cb(&intruder);
        }

        self.current_intruder = Some(intruder);
    }

    /// Each leg timer is checked once per frame. On expiry the next leg starts on this frame and its
    /// output is returned without checking its own timer, so at most one transition happens per
    /// frame even with zero leg times.
    fn process_patrolling(&mut self, now_s: f64) -> ModeOutput {
        if self.state_elapsed(now_s) >= self.params.forward_time_s {
            self.cycle += 1;
            self.set_patrol_state(PatrolState::Rotating, now_s);
            return self.rotate_output();
        }

        self.forward_output()
    }

    fn process_rotating(&mut self, now_s: f64) -> ModeOutput {
        if self.state_elapsed(now_s) >= self.params.rotate_time_s {
            self.set_patrol_state(PatrolState::Patrolling, now_s);
            return self.forward_output();
        }

        self.rotate_output()
    }

    fn forward_output(&self) -> ModeOutput {
        ModeOutput::motion(
            self.params.patrol_velocity_ms,
            0.0,
            ModeState::Running,
            1.0,
            format!("Patrolling - cycle {}", self.cycle),
        )
    }

    /// Even cycles turn left, odd cycles turn right.
    fn rotate_output(&self) -> ModeOutput {
        let direction = if self.cycle % 2 == 0 { 1.0 } else { -1.0 };

        ModeOutput::motion(
            0.0,
            direction * self.params.rotate_yaw_rate_rads,
            ModeState::Running,
            1.0,
            format!("Rotating - cycle {}", self.cycle),
        )
    }

    fn process_alert(&mut self, intruder: Option<&Intruder>, now_s: f64) -> ModeOutput {
        let elapsed = now_s - self.alert_start_s;

        if self.params.track_intruder
            && intruder.is_some()
            && elapsed >= self.params.alert_to_track_delay_s
        {
            self.start_tracking(now_s);
            return self.process_tracking(intruder, now_s);
        }

        if elapsed >= self.params.alert_duration_s {
            match intruder {
                Some(_) => self.start_tracking(now_s),
                None => self.set_patrol_state(PatrolState::Returning, now_s),
            }
        }

        let message = match intruder {
            Some(i) => format!("ALERT! Intruder at {:.1} m", i.distance_m),
            None => String::from("ALERT! Intruder out of view"),
        };

        ModeOutput::motion(0.0, 0.0, ModeState::Running, 1.0, message)
    }

    fn start_tracking(&mut self, now_s: f64) {
        self.set_patrol_state(PatrolState::Tracking, now_s);
        self.track_start_s = now_s;
    }

    fn process_tracking(&mut self, intruder: Option<&Intruder>, now_s: f64) -> ModeOutput {
        if now_s - self.track_start_s >= self.params.max_track_time_s {
            info!("Patrol: tracking timeout, returning to patrol");
            self.set_patrol_state(PatrolState::Returning, now_s);
            return self.core.stop_output("Tracking timeout");
        }

        let intruder = match intruder {
            Some(i) => i,
            None => {
                info!("Patrol: intruder lost, returning to patrol");
                self.set_patrol_state(PatrolState::Returning, now_s);
                return self.core.stop_output("Intruder lost");
            }
        };

        self.current_intruder = Some(intruder.clone());

        let yaw_rate = self
            .core
            .clamp_yaw_rate(-intruder.centre_x * self.params.tracking_gain);

        let distance_error = intruder.distance_m - self.params.tracking_distance_m;
        let velocity = if distance_error > self.params.tracking_deadband_m {
            self.params
                .patrol_velocity_ms
                .min(self.params.approach_gain * distance_error)
        } else if distance_error < -self.params.tracking_deadband_m {
            (-self.params.max_backoff_ms).max(self.params.backoff_gain * distance_error)
        } else {
            0.0
        };

        ModeOutput::motion(
            velocity,
            yaw_rate,
            ModeState::Running,
            intruder.confidence,
            format!("Tracking intruder at {:.1} m", intruder.distance_m),
        )
    }

    fn process_returning(&mut self, now_s: f64) -> ModeOutput {
        if self.state_elapsed(now_s) < self.params.return_time_s {
            return ModeOutput::motion(
                0.0,
                self.params.rotate_yaw_rate_rads,
                ModeState::Running,
                0.8,
                String::from("Returning to patrol"),
            );
        }

        self.current_intruder = None;
        self.set_patrol_state(PatrolState::Patrolling, now_s);
        self.forward_output()
    }

    fn overlay(&self, intruder: Option<&Intruder>, output: &ModeOutput) -> Overlay {
        let alert = matches!(
            self.patrol_state,
            PatrolState::Alert | PatrolState::Tracking
        );

        let banner = if alert {
            String::from("INTRUDER DETECTED!")
        } else {
            String::from("Patrolling...")
        };

        let boxes = intruder
            .map(|i| {
                vec![OverlayBox {
                    bbox: i.bbox,
                    label: format!("{} {:.1}m", i.class_name, i.distance_m),
                    highlight: true,
                }]
            })
            .unwrap_or_default();

        Overlay {
            banner,
            alert,
            boxes,
            info: vec![
                format!("State: {}", self.patrol_state),
                format!("Cycle: {}", self.cycle),
                format!("Intruders: {}", self.history.len()),
                output.message.clone(),
            ],
        }
    }
}

impl Mode for PatrolMode {
    fn name(&self) -> &'static str {
        "Patrol"
    }

    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn process(
        &mut self,
        frame: &Frame,
        depth: Option<&DepthFrame>,
        _feedback: Option<&RobotFeedback>,
    ) -> ModeOutput {
        if let Some(out) = self.core.begin_frame(frame) {
            return out;
        }

        let now_s = frame.timestamp_s;
        if self.state_start_s.is_none() {
            self.state_start_s = Some(now_s);
        }

        let intruder = select_intruder(frame, depth, &self.params);

        if let Some(i) = &intruder {
            if !matches!(
                self.patrol_state,
                PatrolState::Alert | PatrolState::Tracking
            ) {
                self.trigger_alert(i.clone(), now_s);
            }
        }

        let mut output = match self.patrol_state {
            PatrolState::Patrolling => self.process_patrolling(now_s),
            PatrolState::Rotating => self.process_rotating(now_s),
            PatrolState::Alert => self.process_alert(intruder.as_ref(), now_s),
            PatrolState::Tracking => self.process_tracking(intruder.as_ref(), now_s),
            PatrolState::Returning => self.process_returning(now_s),
        };

        output.overlay = Some(self.overlay(intruder.as_ref(), &output));
        output
    }

    /// Enabling restarts the sub-state timer from the next frame.
    fn enable(&mut self) {
        self.core.enable();
        self.state_start_s = None;
    }

    fn reset(&mut self) {
        self.core.reset();
        self.patrol_state = PatrolState::Patrolling;
        self.state_start_s = None;
        self.cycle = 0;
        self.current_intruder = None;
        self.history.clear();
        self.alert_start_s = 0.0;
        self.track_start_s = 0.0;
    }
}

impl Display for PatrolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatrolState::Patrolling => "PATROLLING",
            PatrolState::Rotating => "ROTATING",
            PatrolState::Alert => "ALERT",
            PatrolState::Tracking => "TRACKING",
            PatrolState::Returning => "RETURNING",
        };
        write!(f, "{}", s)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
