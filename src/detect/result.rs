use serde::{Deserialize, Serialize};

/// Upper bound of the public detection coordinate space (both axes).
pub const COORDINATE_SPACE: f32 = 1000.0;

/// A single detection.
///
/// Geometry is corner form: `x`/`y` are the top-left corner, `w`/`h` the
/// extents. Coming out of the decoder the geometry is in model output units;
/// once normalized it lives in `[0,1000] x [0,1000]` regardless of the source
/// resolution, which is the wire contract for detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Class confidence. `0..=1` from the decoder, `0..=100` once normalized.
    #[serde(rename = "c")]
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    /// Epoch milliseconds of the inference cycle that produced this detection.
    pub timestamp: u64,
    /// Handle for re-fetching crop evidence. Valid until the crop cache is reset.
    #[serde(rename = "refId", default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<u64>,
    /// Set to `true` on the detection that raised its label's event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            x,
            y,
            w,
            h,
            timestamp: 0,
            ref_id: None,
            state: None,
        }
    }

    pub fn with_ref_id(mut self, ref_id: u64) -> Self {
        self.ref_id = Some(ref_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Center point derived from the corner-form fields.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn has_finite_geometry(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite())
    }
}
