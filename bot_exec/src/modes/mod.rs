//! # Modes module
//!
//! Every autonomous behaviour implements the [`Mode`] trait. A mode is fed one perception frame
//! per control tick and returns a [`ModeOutput`] holding the velocity and yaw rate it wants the
//! chassis to follow.
//!
//! The lifecycle shared by all modes is held in a [`ModeCore`]:
//!
//! - `enable` - any state to `Running`
//! - `disable` - any state to `Idle`
//! - `pause` - `Running` to `Paused`, otherwise nothing
//! - `resume` - `Paused` to `Running`, otherwise nothing
//!
//! A disabled or paused mode always outputs zero motion. Modes never fail, bad input produces a
//! stop output instead.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod line_follow;
pub mod obj_track;
pub mod params;
pub mod patrol;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    mcu::RobotFeedback,
    per::{BBox, DepthFrame, Frame},
};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use util::maths::{clamp, clamp_sym};

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use self::line_follow::LineFollowMode;
pub use self::obj_track::ObjTrackMode;
pub use self::params::ModesParams;
pub use self::patrol::PatrolMode;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Contract implemented by every autonomous behaviour.
pub trait Mode {
    /// Human readable name of the mode.
    fn name(&self) -> &'static str;

    fn core(&self) -> &ModeCore;

    fn core_mut(&mut self) -> &mut ModeCore;

    /// Process one frame and return the motion the mode wants.
    fn process(
        &mut self,
        frame: &Frame,
        depth: Option<&DepthFrame>,
        feedback: Option<&RobotFeedback>,
    ) -> ModeOutput;

    /// Return the behaviour to its initial sub-state and the mode to disabled.
    fn reset(&mut self);

    fn enable(&mut self) {
        self.core_mut().enable()
    }

    fn disable(&mut self) {
        self.core_mut().disable()
    }

    fn pause(&mut self) {
        self.core_mut().pause()
    }

    fn resume(&mut self) {
        self.core_mut().resume()
    }

    fn state(&self) -> ModeState {
        self.core().state()
    }

    fn is_enabled(&self) -> bool {
        self.core().is_enabled()
    }
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeState {
    /// Constructed or disabled
    Idle,
    Running,
    /// Target lost, looking for it
    Searching,
    Paused,
    Error,
    /// Finite task done
    Completed,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Output of a mode for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeOutput {
    /// Forward velocity demand (m/s)
    pub velocity_ms: f64,

    /// Yaw rate demand (rad/s), positive turns left
    pub yaw_rate_rads: f64,

    pub state: ModeState,

    /// Confidence in the decision, in [0, 1]
    pub confidence: f64,

    pub message: String,

    /// Visualisation data, rendering is left to the consumer
    pub overlay: Option<Overlay>,

    /// The robot must stop now, not just coast to zero
    pub emergency_stop: bool,
}

/// Visualisation payload attached to a mode output.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Overlay {
    /// Headline status text
    pub banner: String,

    /// Draw the banner in the alert style
    pub alert: bool,

    pub boxes: Vec<OverlayBox>,

    /// Extra status lines
    pub info: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayBox {
    pub bbox: BBox,
    pub label: String,
    pub highlight: bool,
}

/// Motion limits applied by a mode to its own demands.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotionLimits {
    pub max_velocity_ms: f64,
    pub min_velocity_ms: f64,
    pub max_yaw_rate_rads: f64,
}

/// Lifecycle state shared by every mode.
#[derive(Debug, Clone)]
pub struct ModeCore {
    name: &'static str,
    state: ModeState,
    enabled: bool,
    frame_count: u64,
    pub limits: MotionLimits,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            max_velocity_ms: 2.0,
            min_velocity_ms: 0.0,
            max_yaw_rate_rads: 1.5,
        }
    }
}

impl ModeOutput {
    /// Zero motion in the given state.
    pub fn stop(state: ModeState, message: &str) -> Self {
        Self {
            velocity_ms: 0.0,
            yaw_rate_rads: 0.0,
            state,
            confidence: 0.0,
            message: message.to_string(),
            overlay: None,
            emergency_stop: false,
        }
    }

    pub fn motion(
        velocity_ms: f64,
        yaw_rate_rads: f64,
        state: ModeState,
        confidence: f64,
        message: String,
    ) -> Self {
        Self {
            velocity_ms,
            yaw_rate_rads,
            state,
            confidence,
            message,
            overlay: None,
            emergency_stop: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.velocity_ms == 0.0 && self.yaw_rate_rads == 0.0
    }
}

impl ModeCore {
    pub fn new(name: &'static str, limits: MotionLimits) -> Self {
        Self {
            name,
            state: ModeState::Idle,
            enabled: false,
            frame_count: 0,
            limits,
        }
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    /// Used by modes whose behaviour maps directly onto the lifecycle state (searching, error).
    pub fn set_state(&mut self, state: ModeState) {
        self.state = state;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of frames processed since the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.state = ModeState::Running;
        info!("{} enabled", self.name);
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.state = ModeState::Idle;
        info!("{} disabled", self.name);
    }

    pub fn pause(&mut self) {
        if self.state == ModeState::Running {
            self.state = ModeState::Paused;
            info!("{} paused", self.name);
        }
    }

    pub fn resume(&mut self) {
        if self.state == ModeState::Paused {
            self.state = ModeState::Running;
            info!("{} resumed", self.name);
        }
    }

    /// Back to disabled and idle with no frames counted.
    pub fn reset(&mut self) {
        self.enabled = false;
        self.state = ModeState::Idle;
        self.frame_count = 0;
    }

    /// Common start of `process`.
    ///
    /// Returns the output to give straight back if the mode is disabled, paused, or the frame is
    /// unusable. Otherwise counts the frame and returns `None`.
    pub fn begin_frame(&mut self, frame: &Frame) -> Option<ModeOutput> {
        if !self.enabled {
            return Some(ModeOutput::stop(ModeState::Idle, "Mode not enabled"));
        }

        if self.state == ModeState::Paused {
            return Some(ModeOutput::stop(ModeState::Paused, "Paused"));
        }

        if !frame.is_valid() {
            return Some(self.stop_output("Invalid frame"));
        }

        self.frame_count += 1;
        None
    }

    pub fn clamp_velocity(&self, v: f64) -> f64 {
        clamp(&v, &self.limits.min_velocity_ms, &self.limits.max_velocity_ms)
    }

    pub fn clamp_yaw_rate(&self, yaw: f64) -> f64 {
        clamp_sym(yaw, self.limits.max_yaw_rate_rads)
    }

    /// Zero motion in the current state.
    pub fn stop_output(&self, message: &str) -> ModeOutput {
        ModeOutput::stop(self.state, message)
    }

    /// Zero motion, error state, emergency stop requested.
    pub fn emergency_output(&self, message: &str) -> ModeOutput {
        ModeOutput {
            emergency_stop: true,
            ..ModeOutput::stop(ModeState::Error, message)
        }
    }
}

impl Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeState::Idle => "IDLE",
            ModeState::Running => "RUNNING",
            ModeState::Searching => "SEARCHING",
            ModeState::Paused => "PAUSED",
            ModeState::Error => "ERROR",
            ModeState::Completed => "COMPLETED",
        };
        write!(f, "{}", s)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn frame() -> Frame {
        Frame {
            width: 640,
            height: 480,
            ..Default::default()
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut core = ModeCore::new("Test", MotionLimits::default());
        assert_eq!(core.state(), ModeState::Idle);
        assert!(!core.is_enabled());

        // Pause and resume do nothing unless running/paused
        core.pause();
        assert_eq!(core.state(), ModeState::Idle);

        core.enable();
        assert_eq!(core.state(), ModeState::Running);

        core.resume();
        assert_eq!(core.state(), ModeState::Running);

        core.pause();
        core.pause();
        assert_eq!(core.state(), ModeState::Paused);

        core.resume();
        assert_eq!(core.state(), ModeState::Running);

        core.disable();
        assert_eq!(core.state(), ModeState::Idle);
        assert!(!core.is_enabled());
    }

    #[test]
    fn test_begin_frame() {
        let mut core = ModeCore::new("Test", MotionLimits::default());

        let out = core.begin_frame(&frame()).unwrap();
        assert_eq!(out.state, ModeState::Idle);
        assert!(out.is_stopped());

        core.enable();
        assert!(core.begin_frame(&frame()).is_none());
        assert_eq!(core.frame_count(), 1);

        let out = core.begin_frame(&Frame::default()).unwrap();
        assert_eq!(out.state, ModeState::Running);
        assert_eq!(out.message, "Invalid frame");
        assert_eq!(core.frame_count(), 1);

        core.pause();
        let out = core.begin_frame(&frame()).unwrap();
        assert_eq!(out.state, ModeState::Paused);
        assert!(out.is_stopped());

        core.reset();
        assert_eq!(core.frame_count(), 0);
        assert!(!core.is_enabled());
    }

    #[test]
    fn test_clamps_and_outputs() {
        let core = ModeCore::new("Test", MotionLimits::default());

        assert_eq!(core.clamp_velocity(3.0), 2.0);
        assert_eq!(core.clamp_velocity(-1.0), 0.0);
        assert_eq!(core.clamp_yaw_rate(-2.0), -1.5);
        assert_eq!(core.clamp_yaw_rate(0.4), 0.4);

        let e = core.emergency_output("stop");
        assert!(e.emergency_stop);
        assert_eq!(e.state, ModeState::Error);
        assert!(e.is_stopped());
    }
}
