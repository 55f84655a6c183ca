//! # Perception script interpreter module
//!
//! This module replays scripted perception frames, allowing the modes to be exercised without a
//! camera or detector attached.
//!
//! A script is a sequence of timed entries of the form:
//!
//! ```text
//! 0.0: {"width": 640, "height": 480};
//! 2.5: {"width": 640, "height": 480, "objects": [...]};
//! ```
//!
//! where the time is in seconds from the start of the script and the payload is a JSON
//! [`Frame`]. The frame's timestamp is always set to the scripted time.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::fs;
use regex::RegexBuilder;
use thiserror::Error;

// Internal
use comms_if::per::Frame;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A frame which is scripted to be delivered at a specific time.
struct ScriptedFrame {
    /// The time the frame becomes available
    exec_time_s: f64,

    frame: Frame
}

/// A script interpreter.
///
/// After initialising with the path to the script use `.get_pending_frames` to acquire the
/// frames which have become due.
pub struct ScriptInterpreter {
    script_path: PathBuf,
    frames: VecDeque<ScriptedFrame>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Could not find the script at {0:?}")]
    ScriptNotFound(PathBuf),

    #[error("Could not load the script: {0}")]
    ScriptLoadError(std::io::Error),

    #[error("The script is empty (or is so bad it can't be read)")]
    ScriptEmpty,

    #[error(
        "Script contains an invalid timestamp: {0}. \
        Should be a float (like 1.0)")]
    InvalidTimestamp(String),

    #[error("Script timestamps must not decrease, {1} s follows {0} s")]
    OutOfOrder(f64, f64),

    #[error("Script contains an invalid frame at {0} s: {1}")]
    InvalidFrame(f64, serde_json::Error)
}

pub enum PendingFrames {
    None,
    Some(Vec<Frame>),
    EndOfScript
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ScriptInterpreter {

    /// Create a new interpreter from the given script path.
    pub fn new<P: AsRef<Path>>(script_path: P) -> Result<Self, ScriptError> {

        // Get the path in a buffer
        let path = PathBuf::from(script_path.as_ref());

        // Check that the script file exists.
        if !path.exists() {
            return Err(ScriptError::ScriptNotFound(path));
        }

        // Load the script into a string
        let script = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => return Err(ScriptError::ScriptLoadError(e))
        };

        let frames = Self::parse(&script)?;

        Ok(ScriptInterpreter {
            script_path: path,
            frames
        })
    }

    /// Parse the contents of a script.
    fn parse(script: &str) -> Result<VecDeque<ScriptedFrame>, ScriptError> {
        let mut frames: VecDeque<ScriptedFrame> = VecDeque::new();

        // Go through the script executing __the magic regex__.
        let re = match RegexBuilder::new(r"^\s*(\d+(\.\d+)?)\s*:\s*([^;]*);")
            .multi_line(true)
            .build()
        {
            Ok(r) => r,
            Err(_) => return Err(ScriptError::ScriptEmpty)
        };

        for cap in re.captures_iter(script) {
            let time_str = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let payload = cap.get(3).map(|m| m.as_str()).unwrap_or("");

            // Parse the exec time
            let exec_time_s: f64 = match time_str.parse() {
                Ok(t) => t,
                Err(e) => return Err(
                    ScriptError::InvalidTimestamp(format!("{}", e)))
            };

            if let Some(last) = frames.back() {
                if exec_time_s < last.exec_time_s {
                    return Err(ScriptError::OutOfOrder(last.exec_time_s, exec_time_s));
                }
            }

            // The payload is a single JSON frame
            let mut frame = match Frame::from_json(payload) {
                Ok(f) => f,
                Err(e) => return Err(ScriptError::InvalidFrame(exec_time_s, e))
            };
            frame.timestamp_s = exec_time_s;

            frames.push_back(ScriptedFrame {
                exec_time_s,
                frame
            });
        }

        if frames.is_empty() {
            return Err(ScriptError::ScriptEmpty)
        }

        Ok(frames)
    }

    /// Return the frames which have become due at `current_time_s`, oldest first.
    pub fn get_pending_frames(&mut self, current_time_s: f64) -> PendingFrames {

        // If the queue is empty the script is over
        if self.frames.is_empty() {
            return PendingFrames::EndOfScript
        }

        let mut frame_vec: Vec<Frame> = vec![];

        while let Some(head) = self.frames.front() {
            if head.exec_time_s > current_time_s {
                break;
            }
            if let Some(f) = self.frames.pop_front() {
                frame_vec.push(f.frame);
            }
        }

        if frame_vec.is_empty() {
            PendingFrames::None
        }
        else {
            PendingFrames::Some(frame_vec)
        }
    }

    /// Path the script was loaded from
    pub fn get_path(&self) -> &Path {
        &self.script_path
    }

    /// Get the number of frames remaining in the script
    pub fn get_num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Get the length of the script in seconds
    pub fn get_duration(&self) -> f64 {
        match self.frames.back() {
            Some(c) => c.exec_time_s,
            None => 0f64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SCRIPT: &str = r#"
        0.0: {"width": 640, "height": 480};
        0.5: {"width": 640, "height": 480, "timestamp_s": 99.0};
        2: {
            "width": 640, "height": 480,
            "objects": [{
                "class_name": "person", "confidence": 0.8,
                "bbox": {"x1": 200, "y1": 100, "x2": 300, "y2": 300},
                "depth_m": 2.0
            }]
        };
    "#;

    fn interpreter(script: &str) -> Result<ScriptInterpreter, ScriptError> {
        Ok(ScriptInterpreter {
            script_path: PathBuf::new(),
            frames: ScriptInterpreter::parse(script)?
        })
    }

    #[test]
    fn test_pending_frames() {
        let mut si = interpreter(SCRIPT).unwrap();
        assert_eq!(si.get_num_frames(), 3);
        assert_eq!(si.get_duration(), 2.0);

        match si.get_pending_frames(0.6) {
            PendingFrames::Some(f) => {
                assert_eq!(f.len(), 2);
                // Scripted time wins over any timestamp in the payload
                assert_eq!(f[1].timestamp_s, 0.5);
            },
            _ => panic!("Expected two frames")
        }

        assert!(matches!(si.get_pending_frames(1.0), PendingFrames::None));

        match si.get_pending_frames(2.0) {
            PendingFrames::Some(f) => assert_eq!(f[0].objects[0].class_name, "person"),
            _ => panic!("Expected one frame")
        }

        assert!(matches!(si.get_pending_frames(3.0), PendingFrames::EndOfScript));
    }

    #[test]
    fn test_bad_scripts() {
        assert!(matches!(interpreter("nothing here"), Err(ScriptError::ScriptEmpty)));
        assert!(matches!(
            interpreter("1.0: {\"width\": 1, \"height\": 1};\n0.5: {\"width\": 1, \"height\": 1};"),
            Err(ScriptError::OutOfOrder(_, _))
        ));
        assert!(matches!(
            interpreter("1.0: {\"width\": \"wide\"};"),
            Err(ScriptError::InvalidFrame(_, _))
        ));
        assert!(matches!(
            ScriptInterpreter::new("/no/such/script.per"),
            Err(ScriptError::ScriptNotFound(_))
        ));
    }
}
