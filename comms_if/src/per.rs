//! # Perception interface
//!
//! Data produced by the external perception stack (image acquisition, object detection, line
//! detection) and consumed by the autonomous modes once per control tick.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use serde_json;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Axis aligned bounding box in pixel coordinates, `(x1, y1)` top left and `(x2, y2)` bottom
/// right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// A single object reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Class label, e.g. `"person"`
    pub class_name: String,

    /// Detector confidence in [0, 1]
    pub confidence: f64,

    pub bbox: BBox,

    /// Distance to the object in metres, zero or negative if unknown
    #[serde(default)]
    pub depth_m: f64,
}

/// Output of the line detector for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineDetection {
    /// Lateral offset of the line from the image centre, normalised to [-1, 1], positive right
    pub position_error: f64,

    /// Angle of the line relative to the forward axis (rad)
    pub heading_error: f64,

    /// Detector confidence in [0, 1]
    pub confidence: f64,
}

/// One perception frame, as handed to the modes each tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Time the frame was acquired (s). All mode timers run on this clock.
    #[serde(default)]
    pub timestamp_s: f64,

    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Detected objects, empty if the detector found nothing or is not running
    #[serde(default)]
    pub objects: Vec<DetectedObject>,

    /// Line detection result, `None` when no line was found
    #[serde(default)]
    pub line: Option<LineDetection>,
}

/// Depth image aligned with the colour frame, row-major, metres. Zero means no reading.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    pub depth_m: Vec<f32>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width in pixels, zero for an inverted box. Computed in `i64` so any pair of corners fits.
    pub fn width(&self) -> i64 {
        (self.x2 as i64 - self.x1 as i64).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 as i64 - self.y1 as i64).max(0)
    }

    /// Area of the box in square pixels, saturating at `i64::MAX`.
    pub fn area(&self) -> i64 {
        self.width().saturating_mul(self.height())
    }

    /// Centre of the box in pixels.
    pub fn centre(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }
}

impl Frame {
    /// Parse a frame from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// A frame with no size cannot be interpreted by any mode.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Normalise a pixel position to [-1, 1] about the image centre.
    pub fn normalise(&self, x: f64, y: f64) -> (f64, f64) {
        let half_w = self.width as f64 / 2.0;
        let half_h = self.height as f64 / 2.0;
        ((x - half_w) / half_w, (y - half_h) / half_h)
    }
}

impl DepthFrame {
    /// Median of the valid depth readings inside the given box, or `None` if there are none.
    ///
    /// The box is clipped to the frame.
    pub fn median_in(&self, bbox: &BBox) -> Option<f64> {
        if self.width == 0 || self.height == 0 {
            return None;
        }

        let x1 = bbox.x1.max(0) as usize;
        let y1 = bbox.y1.max(0) as usize;
        let x2 = (bbox.x2.max(0) as usize).min(self.width as usize);
        let y2 = (bbox.y2.max(0) as usize).min(self.height as usize);

        let mut readings: Vec<f32> = Vec::new();
        for row in y1..y2 {
            for col in x1..x2 {
                if let Some(d) = self.depth_m.get(row * self.width as usize + col) {
                    if d.is_finite() && *d > 0.0 {
                        readings.push(*d);
                    }
                }
            }
        }

        if readings.is_empty() {
            return None;
        }

        readings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(readings[readings.len() / 2] as f64)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bbox() {
        let b = BBox::new(10, 20, 110, 70);
        assert_eq!(b.area(), 5000);
        assert_eq!(b.centre(), (60.0, 45.0));

        // Inverted boxes have no area
        assert_eq!(BBox::new(10, 10, 5, 5).area(), 0);
    }

    #[test]
    fn test_bbox_extreme_coordinates() {
        let b = BBox::new(i32::MIN, 0, i32::MAX, 10);
        assert_eq!(b.width(), u32::MAX as i64);
        assert_eq!(b.height(), 10);
        assert_eq!(b.area(), u32::MAX as i64 * 10);
        assert_eq!(b.centre(), (-0.5, 5.0));

        let full = BBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(full.area(), i64::MAX);

        assert_eq!(BBox::new(i32::MAX, 0, i32::MIN, 10).width(), 0);
    }

    #[test]
    fn test_normalise() {
        let frame = Frame {
            width: 640,
            height: 480,
            ..Default::default()
        };

        assert_eq!(frame.normalise(320.0, 240.0), (0.0, 0.0));
        assert_eq!(frame.normalise(640.0, 0.0), (1.0, -1.0));
        assert_eq!(frame.normalise(160.0, 480.0), (-0.5, 1.0));
        assert!(frame.is_valid());
        assert!(!Frame::default().is_valid());
    }

    #[test]
    fn test_depth_median() {
        let depth = DepthFrame {
            width: 4,
            height: 2,
            depth_m: vec![1.0, 2.0, 0.0, 9.0, 3.0, 0.0, 0.0, 9.0],
        };

        // Zero readings are ignored
        assert_eq!(depth.median_in(&BBox::new(0, 0, 3, 2)), Some(2.0));

        // Box partly outside the frame is clipped
        assert_eq!(depth.median_in(&BBox::new(3, -5, 10, 10)), Some(9.0));

        // No valid readings
        assert_eq!(depth.median_in(&BBox::new(2, 0, 3, 2)), None);
    }

    #[test]
    fn test_frame_from_json() {
        let frame = Frame::from_json(
            r#"{
                "timestamp_s": 1.5, "width": 640, "height": 480,
                "objects": [{
                    "class_name": "person", "confidence": 0.9,
                    "bbox": {"x1": 0, "y1": 0, "x2": 100, "y2": 100}
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(frame.timestamp_s, 1.5);
        assert_eq!(frame.objects.len(), 1);
        assert_eq!(frame.objects[0].depth_m, 0.0);
        assert!(frame.line.is_none());
    }
}
