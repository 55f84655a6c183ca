//! # Line following mode
//!
//! Steers onto a line reported by the perception pipeline, slowing down in curves. If the line is
//! lost the robot rotates towards the side it was last seen on, and gives up after a number of
//! frames.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    mcu::RobotFeedback,
    per::{DepthFrame, Frame, LineDetection},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use util::maths::lin_map;

use super::{Mode, ModeCore, ModeOutput, ModeState, MotionLimits, Overlay};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Heading error treated as a full-scale error when judging curvature (rad).
const FULL_SCALE_HEADING_RAD: f64 = 1.57;

/// Gain of the correction towards the demanded speed when feedback is available.
const VELOCITY_CORRECTION_GAIN: f64 = 0.3;

/// Line position beyond which the search starts on that side.
const SEARCH_SIDE_THRESHOLD: f64 = 0.1;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the line following mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LineFollowParams {
    pub limits: MotionLimits,

    /// Nominal cruise speed (m/s)
    pub base_speed_ms: f64,

    /// Speed on a straight, confidently detected line (m/s)
    pub max_speed_ms: f64,

    /// Speed on the tightest curve (m/s)
    pub min_speed_ms: f64,

    /// Yaw rate per unit of position error
    pub steering_gain: f64,

    /// Yaw rate per radian of heading error
    pub heading_gain: f64,

    /// Yaw rate while searching for a lost line (rad/s)
    pub search_yaw_rate_rads: f64,

    /// Consecutive frames without a line before giving up
    pub max_frames_lost: u32,

    /// Fraction of the speed range given up in curves, in [0, 1]
    pub curvature_slowdown: f64,
}

/// Running statistics of a line following mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineFollowStats {
    pub total_frames: u64,
    pub detected_frames: u64,
    pub detection_rate: f64,
    pub state: ModeState,
    pub frames_lost: u32,
}

pub struct LineFollowMode {
    core: ModeCore,
    params: LineFollowParams,

    frames_lost: u32,
    last_position: f64,

    /// +1 searches right, -1 left
    search_direction: f64,

    detected_frames: u64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for LineFollowParams {
    fn default() -> Self {
        Self {
            limits: MotionLimits::default(),
            base_speed_ms: 1.2,
            max_speed_ms: 2.0,
            min_speed_ms: 0.5,
            steering_gain: 3.0,
            heading_gain: 0.8,
            search_yaw_rate_rads: 0.6,
            max_frames_lost: 30,
            curvature_slowdown: 0.8,
        }
    }
}

impl LineFollowParams {
    pub fn are_valid(&self) -> Result<(), String> {
        if self.min_speed_ms > self.max_speed_ms {
            return Err(format!(
                "line_follow.min_speed_ms ({}) is above max_speed_ms ({})",
                self.min_speed_ms, self.max_speed_ms
            ));
        }

        if !(0.0..=1.0).contains(&self.curvature_slowdown) {
            return Err(format!(
                "line_follow.curvature_slowdown must be in [0, 1], got {}",
                self.curvature_slowdown
            ));
        }

        Ok(())
    }
}

impl LineFollowMode {
    pub fn new(params: LineFollowParams) -> Self {
        Self {
            core: ModeCore::new("Line Following", params.limits),
            params,
            frames_lost: 0,
            last_position: 0.0,
            search_direction: 1.0,
            detected_frames: 0,
        }
    }

    pub fn params(&self) -> &LineFollowParams {
        &self.params
    }

    pub fn statistics(&self) -> LineFollowStats {
        let total = self.core.frame_count();

        LineFollowStats {
            total_frames: total,
            detected_frames: self.detected_frames,
            detection_rate: self.detected_frames as f64 / total.max(1) as f64,
            state: self.core.state(),
            frames_lost: self.frames_lost,
        }
    }

    /// Change the speeds at runtime. The max and min speeds also become the velocity limits.
    pub fn set_speeds(
        &mut self,
        base_speed_ms: Option<f64>,
        max_speed_ms: Option<f64>,
        min_speed_ms: Option<f64>,
    ) {
        if let Some(v) = base_speed_ms {
            self.params.base_speed_ms = v;
        }
        if let Some(v) = max_speed_ms {
            self.params.max_speed_ms = v;
            self.core.limits.max_velocity_ms = v;
        }
        if let Some(v) = min_speed_ms {
            self.params.min_speed_ms = v;
            self.core.limits.min_velocity_ms = v;
        }

        info!(
            "Line following speeds: base = {}, max = {}, min = {}",
            self.params.base_speed_ms, self.params.max_speed_ms, self.params.min_speed_ms
        );
    }

    pub fn set_steering_gains(&mut self, steering_gain: Option<f64>, heading_gain: Option<f64>) {
        if let Some(g) = steering_gain {
            self.params.steering_gain = g;
        }
        if let Some(g) = heading_gain {
            self.params.heading_gain = g;
        }

        info!(
            "Line following gains: steering = {}, heading = {}",
            self.params.steering_gain, self.params.heading_gain
        );
    }

    fn process_detected(
        &mut self,
        line: &LineDetection,
        feedback: Option<&RobotFeedback>,
    ) -> ModeOutput {
        self.detected_frames += 1;
        self.frames_lost = 0;
        self.core.set_state(ModeState::Running);
        self.last_position = line.position_error;

        let yaw_rate = self.core.clamp_yaw_rate(
            self.params.steering_gain * line.position_error
                + self.params.heading_gain * line.heading_error,
        );

        let velocity = self.velocity(line, feedback);

        ModeOutput::motion(
            velocity,
            yaw_rate,
            ModeState::Running,
            line.confidence,
            format!(
                "Following: err = {:.2}, heading = {:.1} deg",
                line.position_error,
                line.heading_error.to_degrees()
            ),
        )
    }

    /// Slow down in curves, speed up on straights.
    fn velocity(&self, line: &LineDetection, feedback: Option<&RobotFeedback>) -> f64 {
        let error = line.position_error.abs() + line.heading_error.abs() / FULL_SCALE_HEADING_RAD;
        let factor = (1.0 - self.params.curvature_slowdown).max(1.0 - error) * line.confidence;

        let mut velocity = lin_map(
            (0.0, 1.0),
            (self.params.min_speed_ms, self.params.max_speed_ms),
            factor,
        );

        if let Some(fb) = feedback.filter(|f| f.valid) {
            velocity += VELOCITY_CORRECTION_GAIN * (velocity - fb.velocity_ms);
        }

        self.core.clamp_velocity(velocity)
    }

    fn process_lost(&mut self) -> ModeOutput {
        self.frames_lost += 1;

        if self.frames_lost > self.params.max_frames_lost {
            if self.core.state() != ModeState::Error {
                warn!("Line lost for {} frames, stopping", self.frames_lost);
            }
            self.core.set_state(ModeState::Error);
            return ModeOutput::stop(
                ModeState::Error,
                &format!("Line lost for {} frames - STOPPED", self.frames_lost),
            );
        }

        self.core.set_state(ModeState::Searching);

        if self.frames_lost == 1 {
            self.search_direction = if self.last_position < -SEARCH_SIDE_THRESHOLD {
                -1.0
            } else {
                1.0
            };
        }

        ModeOutput::motion(
            0.0,
            self.search_direction * self.params.search_yaw_rate_rads,
            ModeState::Searching,
            0.0,
            format!(
                "Searching: direction = {}, frames = {}",
                if self.search_direction > 0.0 { "right" } else { "left" },
                self.frames_lost
            ),
        )
    }

    fn overlay(&self, line: Option<&LineDetection>, output: &ModeOutput) -> Overlay {
        let banner = match output.state {
            ModeState::Running => "LINE FOLLOWING",
            ModeState::Searching => "SEARCHING",
            _ => "LINE LOST",
        };

        let mut info = vec![
            format!("v = {:.2} m/s, yaw = {:.2} rad/s", output.velocity_ms, output.yaw_rate_rads),
            output.message.clone(),
        ];
        if let Some(l) = line {
            info.push(format!("Confidence: {:.2}", l.confidence));
        }

        Overlay {
            banner: String::from(banner),
            alert: output.state == ModeState::Error,
            boxes: vec![],
            info,
        }
    }
}

impl Mode for LineFollowMode {
    fn name(&self) -> &'static str {
        "Line Following"
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
        _depth: Option<&DepthFrame>,
        feedback: Option<&RobotFeedback>,
    ) -> ModeOutput {
        if let Some(out) = self.core.begin_frame(frame) {
            return out;
        }

        let mut output = match frame.line.as_ref() {
            Some(line) => self.process_detected(line, feedback),
            None => self.process_lost(),
        };

        output.overlay = Some(self.overlay(frame.line.as_ref(), &output));
        output
    }

    fn reset(&mut self) {
        self.core.reset();
        self.frames_lost = 0;
        self.last_position = 0.0;
        self.search_direction = 1.0;
        self.detected_frames = 0;
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
