//! Detection data model and the external detector/tracker capabilities.
//!
//! The pipeline consumes detection and tracking as opaque capabilities: a
//! [`Detector`] turns an image into class/confidence/box records and a
//! [`Tracker`] re-associates person boxes with stable identities across
//! frames. Production backends are feature-gated; the default build ships a
//! [`NullDetector`] stub and the greedy IoU tracker in [`tracker`].

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod tracker;

#[cfg(feature = "backend-tch")]
pub mod torch;

pub use tracker::IouTracker;

/// Axis-aligned box in pixel coordinates of the frame used for detection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f32; 4]", from = "[f32; 4]")]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        (right - left).max(0.0) * (bottom - top).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clamp all edges into `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let max_x = (width.saturating_sub(1)) as f32;
        let max_y = (height.saturating_sub(1)) as f32;
        BoundingBox {
            left: self.left.clamp(0.0, max_x),
            top: self.top.clamp(0.0, max_y),
            right: self.right.clamp(0.0, max_x),
            bottom: self.bottom.clamp(0.0, max_y),
        }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.left, bbox.top, bbox.right, bbox.bottom]
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(raw: [f32; 4]) -> Self {
        BoundingBox::new(raw[0], raw[1], raw[2], raw[3])
    }
}

/// Single detection produced for one frame; never mutated after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A person detection carrying the identity assigned by the tracker.
#[derive(Clone, Debug)]
pub struct TrackedPerson {
    pub detection: Detection,
    pub track_id: i64,
    pub centroid: (f32, f32),
}

impl TrackedPerson {
    pub fn new(detection: Detection, track_id: i64) -> Self {
        let centroid = detection.bbox.centroid();
        Self {
            detection,
            track_id,
            centroid,
        }
    }
}

/// Borrowed view of one frame's pixels (BGR8, row-major).
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Object detection capability. Side-effect free; may fail per call.
pub trait Detector: Send {
    fn detect(&mut self, image: ImageView<'_>) -> Result<Vec<Detection>>;
}

/// Identity-assignment capability. Stateful across calls; `reset` discards
/// all learned associations so identities are never reused across a restart.
pub trait Tracker: Send {
    fn update(&mut self, detections: Vec<Detection>) -> Result<Vec<TrackedPerson>>;
    fn reset(&mut self);
}

/// Stub detector for builds without an inference backend.
#[derive(Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, _image: ImageView<'_>) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
