use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Box as reported by a backend, in the pixel space of the image it was given.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class: String,
}

/// Box in the pixel space of the (transformed) live frame it was computed from.
///
/// Never degenerate: `x2 > x1` and `y2 > y1`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class: String,
}

/// Latest result set for one model. Replaced wholesale on every inference.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionSnapshot {
    pub model: String,
    pub detections: Vec<Detection>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl DetectionSnapshot {
    pub fn new(model: impl Into<String>, detections: Vec<Detection>) -> Self {
        Self {
            model: model.into(),
            detections,
            timestamp_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
