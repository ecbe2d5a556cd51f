use crate::detect::result::{Detection, COORDINATE_SPACE};

/// Maps decoder output into the public detection space.
///
/// Geometry goes from model units to `[0,1000]` on both axes, clamped so a box
/// never extends past the far edge. Confidence becomes a whole percentage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Normalizer {
    scale_x: f32,
    scale_y: f32,
}

impl Normalizer {
    /// `normalized_output` models already emit `[0,1]` geometry; others emit
    /// pixels in the model input resolution.
    pub fn new(model_width: u32, model_height: u32, normalized_output: bool) -> Self {
        if normalized_output || model_width == 0 || model_height == 0 {
            return Self {
                scale_x: COORDINATE_SPACE,
                scale_y: COORDINATE_SPACE,
            };
        }
        Self {
            scale_x: COORDINATE_SPACE / model_width as f32,
            scale_y: COORDINATE_SPACE / model_height as f32,
        }
    }

    pub fn apply(&self, det: &mut Detection) {
        let x = (det.x * self.scale_x).clamp(0.0, COORDINATE_SPACE);
        let y = (det.y * self.scale_y).clamp(0.0, COORDINATE_SPACE);
        let right = ((det.x + det.w) * self.scale_x).clamp(0.0, COORDINATE_SPACE);
        let bottom = ((det.y + det.h) * self.scale_y).clamp(0.0, COORDINATE_SPACE);

        det.x = x;
        det.y = y;
        det.w = (right - x).max(0.0);
        det.h = (bottom - y).max(0.0);
        det.confidence = (det.confidence * 100.0).round().clamp(0.0, 100.0);
    }

    pub fn apply_all(&self, detections: &mut [Detection]) {
        for det in detections {
            self.apply(det);
        }
    }
}
