//! # Driver
//!
//! Selects the active mode and connects its output to something that can move the robot.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    mcu::RobotFeedback,
    per::{DepthFrame, Frame},
};
use log::{trace, warn};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::{
    modes::{
        LineFollowMode, Mode, ModeOutput, ModeState, ModesParams, ObjTrackMode, PatrolMode,
    },
    uart_ctrl::{UartCtrl, UartCtrlError},
};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Anything that can accept motion demands from a mode.
pub trait MotionSink {
    fn is_enabled(&self) -> bool;

    /// Number of demands accepted but not yet sent on.
    fn pending(&self) -> usize;

    fn send_motion(&mut self, velocity_ms: f64, yaw_rate_rads: f64) -> Result<(), UartCtrlError>;

    fn emergency_stop(&mut self);
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Which mode to run, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Patrol,
    LineFollow,
    ObjTrack,
}

/// The mode currently driving the robot.
pub enum ActiveMode {
    Patrol(PatrolMode),
    LineFollow(LineFollowMode),
    ObjTrack(ObjTrackMode),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl FromStr for ModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "patrol" => Ok(ModeKind::Patrol),
            "line_follow" | "line" => Ok(ModeKind::LineFollow),
            "obj_track" | "track" => Ok(ModeKind::ObjTrack),
            _ => Err(format!(
                "Unknown mode \"{}\", expected one of patrol, line_follow, obj_track",
                s
            )),
        }
    }
}

impl ActiveMode {
    pub fn new(kind: ModeKind, params: &ModesParams) -> Self {
        match kind {
            ModeKind::Patrol => ActiveMode::Patrol(PatrolMode::new(params.patrol.clone())),
            ModeKind::LineFollow => {
                ActiveMode::LineFollow(LineFollowMode::new(params.line_follow.clone()))
            }
            ModeKind::ObjTrack => ActiveMode::ObjTrack(ObjTrackMode::new(params.obj_track.clone())),
        }
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            ActiveMode::Patrol(_) => ModeKind::Patrol,
            ActiveMode::LineFollow(_) => ModeKind::LineFollow,
            ActiveMode::ObjTrack(_) => ModeKind::ObjTrack,
        }
    }

    pub fn as_mode(&self) -> &dyn Mode {
        match self {
            ActiveMode::Patrol(m) => m,
            ActiveMode::LineFollow(m) => m,
            ActiveMode::ObjTrack(m) => m,
        }
    }

    pub fn as_mode_mut(&mut self) -> &mut dyn Mode {
        match self {
            ActiveMode::Patrol(m) => m,
            ActiveMode::LineFollow(m) => m,
            ActiveMode::ObjTrack(m) => m,
        }
    }

    pub fn patrol(&self) -> Option<&PatrolMode> {
        match self {
            ActiveMode::Patrol(m) => Some(m),
            _ => None,
        }
    }

    pub fn patrol_mut(&mut self) -> Option<&mut PatrolMode> {
        match self {
            ActiveMode::Patrol(m) => Some(m),
            _ => None,
        }
    }

    pub fn process(
        &mut self,
        frame: &Frame,
        depth: Option<&DepthFrame>,
        feedback: Option<&RobotFeedback>,
    ) -> ModeOutput {
        self.as_mode_mut().process(frame, depth, feedback)
    }

    /// Reset the behaviour and enable it again.
    pub fn restart(&mut self) {
        let mode = self.as_mode_mut();
        mode.reset();
        mode.enable();
    }

    pub fn state(&self) -> ModeState {
        self.as_mode().state()
    }
}

impl Display for ActiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_mode().name())
    }
}

impl MotionSink for UartCtrl {
    fn is_enabled(&self) -> bool {
        UartCtrl::is_enabled(self)
    }

    fn pending(&self) -> usize {
        self.queue_len()
    }

    fn send_motion(&mut self, velocity_ms: f64, yaw_rate_rads: f64) -> Result<(), UartCtrlError> {
        self.send_motion_command(velocity_ms, yaw_rate_rads, None, None)
    }

    fn emergency_stop(&mut self) {
        self.send_emergency_stop()
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Run the active mode for one tick and pass its demands to the sink.
///
/// Demands are only forwarded while the sink is enabled and has nothing left to send, so a sink
/// slower than the control loop never builds up a backlog of stale demands. An emergency stop
/// request from the mode always reaches the sink.
pub fn step<S: MotionSink>(
    mode: &mut dyn Mode,
    sink: &mut S,
    frame: &Frame,
    depth: Option<&DepthFrame>,
    feedback: Option<&RobotFeedback>,
) -> ModeOutput {
    let output = mode.process(frame, depth, feedback);

    if output.emergency_stop {
        warn!("{} requested an emergency stop: {}", mode.name(), output.message);
        sink.emergency_stop();
        return output;
    }

    if !sink.is_enabled() {
        trace!("Control disabled, not sending {} output", mode.name());
        return output;
    }

    if sink.pending() > 0 {
        trace!("Previous demand still queued, not sending {} output", mode.name());
        return output;
    }

    if let Err(e) = sink.send_motion(output.velocity_ms, output.yaw_rate_rads) {
        warn!("Could not send {} output: {}", mode.name(), e);
    }

    output
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::modes::{ModeCore, MotionLimits};
    use crate::uart_ctrl::{MockTransport, UartCtrlParams};
    use std::thread;
    use std::time::Duration;

    /// Always asks for an emergency stop.
    struct PanicMode {
        core: ModeCore,
    }

    impl Mode for PanicMode {
        fn name(&self) -> &'static str {
            "Panic"
        }

        fn core(&self) -> &ModeCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModeCore {
            &mut self.core
        }

        fn process(
            &mut self,
            _frame: &Frame,
            _depth: Option<&DepthFrame>,
            _feedback: Option<&RobotFeedback>,
        ) -> ModeOutput {
            self.core.emergency_output("Obstacle")
        }

        fn reset(&mut self) {
            self.core.reset()
        }
    }

    #[derive(Default)]
    struct FakeSink {
        enabled: bool,
        sent: Vec<(f64, f64)>,
        stops: usize,
        backlog: usize,
    }

    impl MotionSink for FakeSink {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn pending(&self) -> usize {
            self.backlog
        }

        fn send_motion(
            &mut self,
            velocity_ms: f64,
            yaw_rate_rads: f64,
        ) -> Result<(), UartCtrlError> {
            self.sent.push((velocity_ms, yaw_rate_rads));
            Ok(())
        }

        fn emergency_stop(&mut self) {
            self.enabled = false;
            self.stops += 1;
        }
    }

    fn frame(t: f64) -> Frame {
        Frame {
            timestamp_s: t,
            width: 640,
            height: 480,
            ..Default::default()
        }
    }

    #[test]
    fn test_mode_kind() {
        assert_eq!("patrol".parse::<ModeKind>(), Ok(ModeKind::Patrol));
        assert_eq!("Line_Follow".parse::<ModeKind>(), Ok(ModeKind::LineFollow));
        assert_eq!("track".parse::<ModeKind>(), Ok(ModeKind::ObjTrack));
        assert!("dance".parse::<ModeKind>().is_err());
    }

    #[test]
    fn test_step_forwards_when_enabled() {
        let mut mode = ActiveMode::new(ModeKind::Patrol, &ModesParams::default());
        mode.restart();
        assert_eq!(mode.to_string(), "Patrol");
        assert_eq!(mode.kind(), ModeKind::Patrol);

        let mut sink = FakeSink::default();

        step(mode.as_mode_mut(), &mut sink, &frame(0.0), None, None);
        assert!(sink.sent.is_empty());

        sink.enabled = true;
        let out = step(mode.as_mode_mut(), &mut sink, &frame(0.1), None, None);
        assert_eq!(sink.sent, vec![(out.velocity_ms, out.yaw_rate_rads)]);
        assert_eq!(sink.sent[0].0, 0.3);
    }

    #[test]
    fn test_step_lost_line_stops() {
        let mut mode = ActiveMode::new(ModeKind::LineFollow, &ModesParams::default());
        mode.restart();
        let mut sink = FakeSink {
            enabled: true,
            ..Default::default()
        };

        let out = step(mode.as_mode_mut(), &mut sink, &frame(0.0), None, None);
        assert_eq!(out.state, ModeState::Searching);
        assert_eq!(mode.state(), ModeState::Searching);
        assert_eq!(sink.sent.len(), 1);
        assert_eq!(sink.stops, 0);
        assert!(mode.patrol().is_none());
    }

    #[test]
    fn test_step_emergency_stop() {
        let mut mode = PanicMode {
            core: ModeCore::new("Panic", MotionLimits::default()),
        };
        let mut sink = FakeSink {
            enabled: true,
            ..Default::default()
        };

        let out = step(&mut mode, &mut sink, &frame(0.0), None, None);
        assert!(out.emergency_stop);
        assert_eq!(sink.stops, 1);
        assert!(sink.sent.is_empty());
        assert!(!sink.enabled);
    }

    #[test]
    fn test_step_waits_for_backlog() {
        let mut mode = ActiveMode::new(ModeKind::Patrol, &ModesParams::default());
        mode.restart();
        let mut sink = FakeSink {
            enabled: true,
            backlog: 2,
            ..Default::default()
        };

        step(mode.as_mode_mut(), &mut sink, &frame(0.0), None, None);
        assert!(sink.sent.is_empty());

        sink.backlog = 0;
        step(mode.as_mode_mut(), &mut sink, &frame(0.05), None, None);
        assert_eq!(sink.sent.len(), 1);
    }

    #[test]
    fn test_queue_bounded_when_loop_outpaces_sender() {
        // Control loop at 20 Hz, sender at 10 commands per second
        let mock = MockTransport::new();
        let mut ctrl = UartCtrl::new(UartCtrlParams {
            enable_settle_s: 0.0,
            ..Default::default()
        })
        .unwrap();
        ctrl.connect_with(Box::new(mock.clone())).unwrap();
        ctrl.enable_control().unwrap();

        let mut mode = ActiveMode::new(ModeKind::Patrol, &ModesParams::default());
        mode.restart();

        let mut max_queue = 0;
        for i in 0..40 {
            step(
                mode.as_mode_mut(),
                &mut ctrl,
                &frame(i as f64 * 0.05),
                None,
                None,
            );
            max_queue = max_queue.max(ctrl.queue_len());
            thread::sleep(Duration::from_millis(50));
        }

        assert!(max_queue <= 2, "queue reached {}", max_queue);
        assert!(mock.written_lines().contains(&"V300".to_string()));

        ctrl.disconnect();
    }
}
