//! # Intruder detection

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::per::{BBox, DepthFrame, DetectedObject, Frame};
use serde::Serialize;
use std::collections::VecDeque;

use super::params::PatrolParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Added to the distance when scoring so that very close detections do not dominate.
const SCORE_DISTANCE_OFFSET_M: f64 = 0.1;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A detection accepted as an intruder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intruder {
    pub class_name: String,
    pub confidence: f64,
    pub bbox: BBox,

    /// Distance to the intruder, infinite if unknown (m)
    pub distance_m: f64,

    /// Horizontal centre of the box normalised to [-1, 1], positive to the right
    pub centre_x: f64,

    /// Vertical centre of the box normalised to [-1, 1], positive downwards
    pub centre_y: f64,

    /// Frame timestamp at which the intruder was seen (s)
    pub timestamp_s: f64,
}

/// Record of every intruder that raised an alert, oldest first.
#[derive(Debug, Clone, Default)]
pub struct IntruderHistory {
    entries: VecDeque<Intruder>,
    limit: Option<usize>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Intruder {
    /// Score used to choose between several candidates, higher is more threatening.
    pub fn score(&self) -> f64 {
        self.confidence / (self.distance_m + SCORE_DISTANCE_OFFSET_M)
    }
}

impl IntruderHistory {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    /// Append an intruder, dropping the oldest if the history is full.
    pub fn push(&mut self, intruder: Intruder) {
        if let Some(limit) = self.limit {
            if limit == 0 {
                return;
            }
            while self.entries.len() >= limit {
                self.entries.pop_front();
            }
        }
        self.entries.push_back(intruder);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }

    pub fn to_vec(&self) -> Vec<Intruder> {
        self.entries.iter().cloned().collect()
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Pick the most threatening intruder in the frame, if any.
///
/// A candidate must be of the detected class, confident enough, large enough and within the
/// alert distance. Its distance comes from the detection itself, then the depth frame, and is
/// otherwise unknown, which puts it out of range. Candidates are ranked by
/// `confidence / (distance + 0.1)`, the first of any tie wins.
pub fn select_intruder(
    frame: &Frame,
    depth: Option<&DepthFrame>,
    params: &PatrolParams,
) -> Option<Intruder> {
    let mut best: Option<Intruder> = None;
    let mut best_score = 0.0;

    for obj in frame.objects.iter() {
        if obj.class_name != params.detect_class
            || obj.confidence < params.min_confidence
            || obj.bbox.area() < params.min_box_area
        {
            continue;
        }

        let distance_m = object_distance(obj, depth);
        if distance_m > params.alert_distance_m {
            continue;
        }

        let (cx, cy) = obj.bbox.centre();
        let (centre_x, centre_y) = frame.normalise(cx, cy);

        let candidate = Intruder {
            class_name: obj.class_name.clone(),
            confidence: obj.confidence,
            bbox: obj.bbox,
            distance_m,
            centre_x,
            centre_y,
            timestamp_s: frame.timestamp_s,
        };

        let score = candidate.score();
        if score > best_score {
            best_score = score;
            best = Some(candidate);
        }
    }

    best
}

/// Distance to an object, or infinity if nothing measured it.
fn object_distance(obj: &DetectedObject, depth: Option<&DepthFrame>) -> f64 {
    if obj.depth_m > 0.0 {
        return obj.depth_m;
    }

    depth
        .and_then(|d| d.median_in(&obj.bbox))
        .unwrap_or(std::f64::INFINITY)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

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
            timestamp_s: 1.0,
            width: 640,
            height: 480,
            objects,
            line: None,
        }
    }

    #[test]
    fn test_filters() {
        let params = PatrolParams::default();
        let big = BBox::new(100, 100, 200, 300);

        let f = frame(vec![
            obj("chair", 0.9, big, 1.0),
            obj("person", 0.3, big, 1.0),
            obj("person", 0.9, BBox::new(0, 0, 10, 10), 1.0),
            obj("person", 0.9, big, 4.0),
            obj("person", 0.9, big, 0.0),
        ]);

        assert_eq!(select_intruder(&f, None, &params), None);
    }

    #[test]
    fn test_best_score() {
        let params = PatrolParams::default();

        // 0.9 / 2.6 < 0.6 / 1.1
        let f = frame(vec![
            obj("person", 0.9, BBox::new(0, 0, 100, 100), 2.5),
            obj("person", 0.6, BBox::new(320, 0, 420, 100), 1.0),
        ]);

        let i = select_intruder(&f, None, &params).unwrap();
        assert_eq!(i.distance_m, 1.0);
        assert_eq!(i.bbox, BBox::new(320, 0, 420, 100));
        assert!((i.centre_x - 0.15625).abs() < 1e-9);
        assert_eq!(i.timestamp_s, 1.0);
    }

    #[test]
    fn test_depth_frame_fallback() {
        let params = PatrolParams::default();
        let depth = DepthFrame {
            width: 640,
            height: 480,
            depth_m: vec![2.0; 640 * 480],
        };

        let f = frame(vec![obj("person", 0.8, BBox::new(100, 100, 200, 300), 0.0)]);

        let i = select_intruder(&f, Some(&depth), &params).unwrap();
        assert_eq!(i.distance_m, 2.0);
    }

    #[test]
    fn test_history_limit() {
        let f = frame(vec![obj("person", 0.8, BBox::new(0, 0, 100, 100), 1.0)]);
        let i = select_intruder(&f, None, &PatrolParams::default()).unwrap();

        let mut history = IntruderHistory::new(Some(2));
        for t in 0..3 {
            history.push(Intruder {
                timestamp_s: t as f64,
                ..i.clone()
            });
        }

        let v = history.to_vec();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].timestamp_s, 1.0);
        assert_eq!(v[1].timestamp_s, 2.0);

        let mut unbounded = IntruderHistory::new(None);
        for _ in 0..10 {
            unbounded.push(i.clone());
        }
        assert_eq!(unbounded.len(), 10);
    }
}
