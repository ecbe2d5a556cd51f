//! Topic names and JSON payloads for everything the pipeline publishes.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crop::Evidence;
use crate::detect::Detection;
use crate::events::gate::{LabelState, StateChange};

/// Replace whitespace in a label so it can be used as a topic level.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

pub fn detection_topic(serial: &str) -> String {
    format!("detection/{}", serial)
}

pub fn event_topic(serial: &str, label: &str, state: LabelState) -> String {
    format!(
        "event/{}/{}/{}",
        serial,
        sanitize_label(label),
        state.is_high()
    )
}

pub fn crop_topic(serial: &str) -> String {
    format!("crop/{}", serial)
}

#[derive(Serialize)]
struct DetectionsPayload<'a> {
    detections: &'a [Detection],
}

/// `{"detections": [...]}`
pub fn detections_payload(detections: &[Detection]) -> Result<Value> {
    Ok(serde_json::to_value(DetectionsPayload { detections })?)
}

#[derive(Serialize)]
struct FallingEdgePayload<'a> {
    label: &'a str,
    state: bool,
    timestamp: u64,
}

/// Rising edges carry the raising detection (with `state: true`); falling
/// edges carry only label, state and timestamp.
pub fn state_change_payload(change: &StateChange) -> Result<Value> {
    match (&change.detection, change.state) {
        (Some(detection), LabelState::High) => {
            let mut detection = detection.clone();
            detection.state = Some(true);
            Ok(serde_json::to_value(detection)?)
        }
        _ => Ok(serde_json::to_value(FallingEdgePayload {
            label: &change.label,
            state: change.state.is_high(),
            timestamp: change.timestamp,
        })?),
    }
}

/// Crop image published on the crop topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CropPayload {
    pub label: String,
    pub timestamp: u64,
    pub confidence: u32,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Base64 JPEG.
    pub image: String,
}

impl CropPayload {
    /// Geometry is the crop rectangle in source pixels.
    pub fn new(detection: &Detection, evidence: &Evidence) -> Self {
        Self {
            label: detection.label.clone(),
            timestamp: detection.timestamp,
            confidence: detection.confidence.max(0.0).round() as u32,
            x: evidence.crop.x,
            y: evidence.crop.y,
            w: evidence.crop.w,
            h: evidence.crop.h,
            image: STANDARD.encode(&evidence.jpeg),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
