//! # Object tracking mode
//!
//! Follows an object of a chosen class, keeping it centred in the image and at a set distance.
//! Both demands are exponentially smoothed so the robot moves like a gimbal rather than snapping
//! onto the target.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    mcu::RobotFeedback,
    per::{DepthFrame, DetectedObject, Frame},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use util::maths::{clamp, deadband, smooth};

use super::{Mode, ModeCore, ModeOutput, ModeState, MotionLimits, Overlay, OverlayBox};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Reverse speed used when the target is too close (m/s).
const BACKUP_SPEED_MS: f64 = -0.2;

/// Fraction of the max speed allowed in reverse.
const MAX_REVERSE_FRACTION: f64 = 0.3;

/// Fraction of the approach speed used when the target distance is unknown.
const BLIND_APPROACH_FRACTION: f64 = 0.5;

/// Range accepted by `set_target_distance` (m).
const TARGET_DISTANCE_RANGE_M: (f64, f64) = (0.5, 5.0);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the object tracking mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjTrackParams {
    /// Class of object to follow, compared case-insensitively
    pub target_class: String,

    /// Distance to hold from the target (m)
    pub target_distance_m: f64,

    pub max_speed_ms: f64,
    pub min_speed_ms: f64,

    /// Speed used to close in on a target whose distance is unknown (m/s)
    pub approach_speed_ms: f64,

    /// Yaw rate per unit of normalised horizontal error
    pub steering_gain: f64,
    pub max_yaw_rate_rads: f64,

    /// Horizontal errors smaller than this are ignored
    pub steering_deadband: f64,

    /// Distance errors smaller than this are ignored (m)
    pub distance_deadband_m: f64,

    /// Speed per metre of distance error
    pub distance_gain: f64,

    /// Closer than this the robot backs off or stops (m)
    pub min_safe_distance_m: f64,

    /// Targets further than this are ignored (m)
    pub max_tracking_distance_m: f64,

    /// Reverse when closer than the safe distance, otherwise just stop
    pub backup_on_too_close: bool,

    pub search_yaw_rate_rads: f64,

    /// Consecutive frames without a target before giving up
    pub max_frames_lost: u32,

    /// Weight of the previous yaw demand, in [0, 1)
    pub yaw_smoothing: f64,

    /// Weight of the previous velocity demand, in [0, 1)
    pub velocity_smoothing: f64,

    pub min_confidence: f64,

    /// Minimum bounding box area (px^2)
    pub min_box_area: i64,
}

/// Running statistics of an object tracking mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjTrackStats {
    pub total_frames: u64,
    pub tracking_frames: u64,
    pub tracking_rate: f64,
    pub state: ModeState,
    pub frames_lost: u32,
    pub target_class: String,
}

/// A chosen target with its measured distance.
#[derive(Debug, Clone)]
struct Target {
    obj: DetectedObject,

    /// 0 if unknown (m)
    distance_m: f64,
}

pub struct ObjTrackMode {
    core: ModeCore,
    params: ObjTrackParams,

    target: Option<DetectedObject>,
    frames_lost: u32,
    last_position: f64,
    search_direction: f64,

    smoothed_yaw_rate: f64,
    smoothed_velocity: f64,

    tracking_frames: u64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ObjTrackParams {
    fn default() -> Self {
        Self {
            target_class: String::from("person"),
            target_distance_m: 1.5,
            max_speed_ms: 1.0,
            min_speed_ms: 0.0,
            approach_speed_ms: 0.5,
            steering_gain: 2.0,
            max_yaw_rate_rads: 1.0,
            steering_deadband: 0.05,
            distance_deadband_m: 0.2,
            distance_gain: 0.5,
            min_safe_distance_m: 0.5,
            max_tracking_distance_m: 5.0,
            backup_on_too_close: true,
            search_yaw_rate_rads: 0.4,
            max_frames_lost: 60,
            yaw_smoothing: 0.3,
            velocity_smoothing: 0.3,
            min_confidence: 0.5,
            min_box_area: 2000,
        }
    }
}

impl ObjTrackParams {
    pub fn are_valid(&self) -> Result<(), String> {
        for (name, value) in [
            ("yaw_smoothing", self.yaw_smoothing),
            ("velocity_smoothing", self.velocity_smoothing),
        ]
        .iter()
        {
            if !(0.0..1.0).contains(value) {
                return Err(format!("obj_track.{} must be in [0, 1), got {}", name, value));
            }
        }

        if self.min_speed_ms > self.max_speed_ms {
            return Err(String::from("obj_track.min_speed_ms is above max_speed_ms"));
        }

        Ok(())
    }

    fn limits(&self) -> MotionLimits {
        MotionLimits {
            max_velocity_ms: self.max_speed_ms,
            min_velocity_ms: self.min_speed_ms,
            max_yaw_rate_rads: self.max_yaw_rate_rads,
        }
    }
}

impl ObjTrackMode {
    pub fn new(params: ObjTrackParams) -> Self {
        info!("Object tracking target is '{}'", params.target_class);

        Self {
            core: ModeCore::new("Object Tracking", params.limits()),
            params,
            target: None,
            frames_lost: 0,
            last_position: 0.0,
            search_direction: 1.0,
            smoothed_yaw_rate: 0.0,
            smoothed_velocity: 0.0,
            tracking_frames: 0,
        }
    }

    pub fn params(&self) -> &ObjTrackParams {
        &self.params
    }

    /// The last target seen, if any.
    pub fn target(&self) -> Option<&DetectedObject> {
        self.target.as_ref()
    }

    /// Follow a different class of object. Tracking starts again from scratch, the mode stays
    /// enabled.
    pub fn set_target_class(&mut self, class_name: &str) {
        self.params.target_class = class_name.to_string();
        self.clear_tracking();
        info!("Object tracking target changed to '{}'", class_name);
    }

    /// Set the distance to hold from the target, limited to between 0.5 and 5 m.
    pub fn set_target_distance(&mut self, distance_m: f64) {
        self.params.target_distance_m =
            clamp(&distance_m, &TARGET_DISTANCE_RANGE_M.0, &TARGET_DISTANCE_RANGE_M.1);
        info!(
            "Object tracking distance set to {:.1} m",
            self.params.target_distance_m
        );
    }

    pub fn statistics(&self) -> ObjTrackStats {
        let total = self.core.frame_count();

        ObjTrackStats {
            total_frames: total,
            tracking_frames: self.tracking_frames,
            tracking_rate: self.tracking_frames as f64 / total.max(1) as f64,
            state: self.core.state(),
            frames_lost: self.frames_lost,
            target_class: self.params.target_class.clone(),
        }
    }

    fn clear_tracking(&mut self) {
        self.target = None;
        self.frames_lost = 0;
        self.last_position = 0.0;
        self.search_direction = 1.0;
        self.smoothed_yaw_rate = 0.0;
        self.smoothed_velocity = 0.0;
        self.tracking_frames = 0;
    }

    /// Choose the largest qualifying object, then the most confident.
    fn find_target(&self, frame: &Frame, depth: Option<&DepthFrame>) -> Option<Target> {
        let mut best: Option<Target> = None;

        for obj in frame.objects.iter() {
            if !obj.class_name.eq_ignore_ascii_case(&self.params.target_class)
                || obj.confidence < self.params.min_confidence
                || obj.bbox.area() < self.params.min_box_area
            {
                continue;
            }

            let distance_m = if obj.depth_m > 0.0 {
                obj.depth_m
            } else {
                depth.and_then(|d| d.median_in(&obj.bbox)).unwrap_or(0.0)
            };

            if distance_m > self.params.max_tracking_distance_m {
                continue;
            }

            let better = match &best {
                None => true,
                Some(b) => {
                    let (area, b_area) = (obj.bbox.area(), b.obj.bbox.area());
                    area > b_area || (area == b_area && obj.confidence > b.obj.confidence)
                }
            };

            if better {
                best = Some(Target {
                    obj: obj.clone(),
                    distance_m,
                });
            }
        }

        best
    }

    fn process_found(&mut self, frame: &Frame, target: Target) -> ModeOutput {
        self.tracking_frames += 1;
        self.frames_lost = 0;
        self.core.set_state(ModeState::Running);

        let (cx, _) = target.obj.bbox.centre();
        let (position_error, _) = frame.normalise(cx, 0.0);
        self.last_position = position_error;

        let yaw_rate = self.yaw_rate(position_error);
        let velocity = self.velocity(target.distance_m);

        let output = ModeOutput::motion(
            velocity,
            yaw_rate,
            ModeState::Running,
            target.obj.confidence,
            format!(
                "Tracking {}: d = {:.2} m, err = {:+.2}",
                self.params.target_class, target.distance_m, position_error
            ),
        );

        self.target = Some(target.obj);
        output
    }

    fn yaw_rate(&mut self, position_error: f64) -> f64 {
        let demand = self.core.clamp_yaw_rate(
            -self.params.steering_gain * deadband(position_error, self.params.steering_deadband),
        );

        self.smoothed_yaw_rate = smooth(self.smoothed_yaw_rate, demand, self.params.yaw_smoothing);
        self.smoothed_yaw_rate
    }

    fn velocity(&mut self, distance_m: f64) -> f64 {
        if distance_m <= 0.0 {
            return self.params.approach_speed_ms * BLIND_APPROACH_FRACTION;
        }

        let error = distance_m - self.params.target_distance_m;

        let demand = if error.abs() < self.params.distance_deadband_m {
            0.0
        } else if distance_m < self.params.min_safe_distance_m {
            if self.params.backup_on_too_close {
                BACKUP_SPEED_MS
            } else {
                0.0
            }
        } else {
            clamp(
                &(error * self.params.distance_gain),
                &(-self.params.max_speed_ms * MAX_REVERSE_FRACTION),
                &self.params.max_speed_ms,
            )
        };

        self.smoothed_velocity = smooth(
            self.smoothed_velocity,
            demand,
            self.params.velocity_smoothing,
        );
        self.smoothed_velocity
    }

    fn process_lost(&mut self) -> ModeOutput {
        self.frames_lost += 1;

        if self.frames_lost > self.params.max_frames_lost {
            if self.core.state() != ModeState::Error {
                warn!(
                    "{} lost for {} frames, stopping",
                    self.params.target_class, self.frames_lost
                );
            }
            self.core.set_state(ModeState::Error);
            return ModeOutput::stop(
                ModeState::Error,
                &format!("Target lost for {} frames - STOPPED", self.frames_lost),
            );
        }

        self.core.set_state(ModeState::Searching);

        if self.frames_lost == 1 {
            self.search_direction = if self.last_position > 0.0 { 1.0 } else { -1.0 };
        }

        ModeOutput::motion(
            0.0,
            self.search_direction * self.params.search_yaw_rate_rads,
            ModeState::Searching,
            0.0,
            format!(
                "Searching for {}... ({})",
                self.params.target_class, self.frames_lost
            ),
        )
    }

    fn overlay(&self, found: bool, output: &ModeOutput) -> Overlay {
        let boxes = match (&self.target, found) {
            (Some(t), true) => vec![OverlayBox {
                bbox: t.bbox,
                label: format!("{} {:.0}%", t.class_name, t.confidence * 100.0),
                highlight: true,
            }],
            _ => vec![],
        };

        Overlay {
            banner: format!("OBJECT TRACKING: {}", self.params.target_class),
            alert: output.state == ModeState::Error,
            boxes,
            info: vec![
                format!("State: {}", output.state),
                format!("v = {:.2} m/s, yaw = {:.2} rad/s", output.velocity_ms, output.yaw_rate_rads),
                output.message.clone(),
            ],
        }
    }
}

impl Mode for ObjTrackMode {
    fn name(&self) -> &'static str {
        "Object Tracking"
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

        let (mut output, found) = match self.find_target(frame, depth) {
            Some(t) => (self.process_found(frame, t), true),
            None => (self.process_lost(), false),
        };

        output.overlay = Some(self.overlay(found, &output));
        output
    }

    fn reset(&mut self) {
        self.core.reset();
        self.clear_tracking();
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::per::BBox;

    const EPS: f64 = 1e-9;

    fn obj(class: &str, conf: f64, bbox: BBox, depth_m: f64) -> DetectedObject {
        DetectedObject {
            class_name: class.to_string(),
            confidence: conf,
            bbox,
            depth_m,
        }
    }

    fn frame(objects: Vec<DetectedObject>) -> Frame {
        Frame {
            timestamp_s: 0.0,
            width: 640,
            height: 480,
            objects,
            line: None,
        }
    }

    /// A 100 x 100 box centred at `cx`.
    fn box_at(cx: i32) -> BBox {
        BBox::new(cx - 50, 100, cx + 50, 200)
    }

    fn unsmoothed() -> ObjTrackParams {
        ObjTrackParams {
            yaw_smoothing: 0.0,
            velocity_smoothing: 0.0,
            ..Default::default()
        }
    }

    fn enabled_mode(params: ObjTrackParams) -> ObjTrackMode {
        let mut mode = ObjTrackMode::new(params);
        mode.enable();
        mode
    }

    #[test]
    fn test_target_selection() {
        let mode = ObjTrackMode::new(ObjTrackParams::default());

        let f = frame(vec![
            obj("Person", 0.6, BBox::new(0, 0, 100, 100), 2.0),
            obj("person", 0.9, BBox::new(0, 0, 100, 100), 2.0),
            obj("person", 0.99, BBox::new(0, 0, 200, 200), 6.0),
            obj("person", 0.3, BBox::new(0, 0, 300, 300), 2.0),
            obj("dog", 0.9, BBox::new(0, 0, 300, 300), 2.0),
            obj("person", 0.9, BBox::new(0, 0, 10, 10), 2.0),
        ]);

        let t = mode.find_target(&f, None).unwrap();
        assert_eq!(t.obj.confidence, 0.9);

        // Case-insensitive, and unknown distance does not exclude
        let f = frame(vec![obj("PERSON", 0.7, BBox::new(0, 0, 100, 100), 0.0)]);
        let t = mode.find_target(&f, None).unwrap();
        assert_eq!(t.distance_m, 0.0);
    }

    #[test]
    fn test_steering() {
        let mut mode = enabled_mode(unsmoothed());

        // Right of centre by 0.25, turn right
        let out = mode.process(&frame(vec![obj("person", 0.8, box_at(400), 1.5)]), None, None);
        assert!((out.yaw_rate_rads - -0.5).abs() < EPS);
        assert_eq!(out.velocity_ms, 0.0);
        assert_eq!(out.state, ModeState::Running);
        assert_eq!(out.confidence, 0.8);

        // Inside the steering deadband
        let out = mode.process(&frame(vec![obj("person", 0.8, box_at(330), 1.5)]), None, None);
        assert_eq!(out.yaw_rate_rads, 0.0);

        // Clamped to the max yaw rate
        let out = mode.process(&frame(vec![obj("person", 0.8, box_at(50), 1.5)]), None, None);
        assert!((out.yaw_rate_rads - 1.0).abs() < EPS);
    }

    #[test]
    fn test_distance_keeping() {
        let mut mode = enabled_mode(unsmoothed());
        let at = |d: f64| frame(vec![obj("person", 0.8, box_at(320), d)]);

        let out = mode.process(&at(2.5), None, None);
        assert!((out.velocity_ms - 0.5).abs() < EPS);

        let out = mode.process(&at(4.9), None, None);
        assert!((out.velocity_ms - 1.0).abs() < EPS);

        let out = mode.process(&at(0.6), None, None);
        assert!((out.velocity_ms - -0.3).abs() < EPS);

        let out = mode.process(&at(0.4), None, None);
        assert!((out.velocity_ms - -0.2).abs() < EPS);

        let out = mode.process(&at(0.0), None, None);
        assert!((out.velocity_ms - 0.25).abs() < EPS);

        let mut cautious = enabled_mode(ObjTrackParams {
            backup_on_too_close: false,
            ..unsmoothed()
        });
        let out = cautious.process(&at(0.4), None, None);
        assert_eq!(out.velocity_ms, 0.0);
    }

    #[test]
    fn test_smoothing() {
        let mut mode = enabled_mode(ObjTrackParams::default());
        let f = frame(vec![obj("person", 0.8, box_at(400), 2.5)]);

        let out = mode.process(&f, None, None);
        assert!((out.yaw_rate_rads - -0.35).abs() < EPS);
        assert!((out.velocity_ms - 0.35).abs() < EPS);

        let out = mode.process(&f, None, None);
        assert!((out.yaw_rate_rads - -0.455).abs() < EPS);
    }

    #[test]
    fn test_lost() {
        let mut mode = enabled_mode(ObjTrackParams {
            max_frames_lost: 2,
            ..unsmoothed()
        });

        mode.process(&frame(vec![obj("person", 0.8, box_at(100), 1.5)]), None, None);

        let out = mode.process(&frame(vec![]), None, None);
        assert_eq!(out.state, ModeState::Searching);
        assert!((out.yaw_rate_rads - -0.4).abs() < EPS);

        mode.process(&frame(vec![]), None, None);
        let out = mode.process(&frame(vec![]), None, None);
        assert_eq!(out.state, ModeState::Error);
        assert!(out.is_stopped());
        assert_eq!(mode.state(), ModeState::Error);
    }

    #[test]
    fn test_setters() {
        let mut mode = enabled_mode(unsmoothed());

        mode.process(&frame(vec![obj("person", 0.8, box_at(320), 1.5)]), None, None);
        assert!(mode.target().is_some());

        mode.set_target_class("dog");
        assert!(mode.target().is_none());
        assert!(mode.is_enabled());
        assert_eq!(mode.statistics().target_class, "dog");
        assert_eq!(mode.statistics().tracking_frames, 0);

        mode.set_target_distance(10.0);
        assert_eq!(mode.params().target_distance_m, 5.0);
        mode.set_target_distance(0.1);
        assert_eq!(mode.params().target_distance_m, 0.5);

        mode.reset();
        assert!(!mode.is_enabled());
        assert_eq!(mode.statistics().total_frames, 0);
    }
}
