//! Wire types shared between the pipeline driver and the HTTP surface.

use detect_core::BoundingBox;
use serde::{Deserialize, Serialize};

use crate::{safety::SafetyEvent, zones::ZoneState};

/// One detection as published to viewers. `track_id` is present only for
/// people while tracking is enabled.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionRecord {
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
}

/// The per-cycle push message.
#[derive(Serialize)]
pub struct FrameMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sequence: u64,
    pub timestamp_ms: i64,
    /// Base64-encoded JPEG of the annotated frame.
    pub frame: &'a str,
    pub detections: &'a [DetectionRecord],
    pub zone_state: &'a ZoneState,
    pub events: &'a [SafetyEvent],
}

/// A serialized message ready for fan-out.
pub struct BroadcastPayload {
    pub sequence: u64,
    pub json: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub viewer_count: usize,
    pub pipeline_state: &'static str,
    pub last_sequence: u64,
}

/// Runtime tunables as reported by `GET /config`.
#[derive(Serialize)]
pub struct TunablesView {
    pub every_nth_frame: u64,
    pub max_width: u32,
    pub confidence_threshold: f32,
    pub jpeg_quality: u8,
    pub target_fps: f32,
    pub idle_fps: f32,
    pub max_detections: usize,
    pub tracking_enabled: bool,
}

impl TunablesView {
    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        Self {
            every_nth_frame: config.every_nth_frame,
            max_width: config.max_width,
            confidence_threshold: config.confidence_threshold,
            jpeg_quality: config.jpeg_quality,
            target_fps: config.target_fps,
            idle_fps: config.idle_fps,
            max_detections: config.max_detections,
            tracking_enabled: config.tracking_enabled,
        }
    }
}

#[derive(Deserialize)]
pub struct LineRequest {
    pub start: (f32, f32),
    pub end: (f32, f32),
}

#[derive(Deserialize)]
pub struct PolygonRequest {
    pub vertices: Vec<(f32, f32)>,
}

#[derive(Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Deserialize)]
pub struct TrackingRequest {
    pub enabled: bool,
}
