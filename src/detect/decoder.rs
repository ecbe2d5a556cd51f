use log::{debug, warn};

use crate::detect::result::Detection;

/// Label used when the winning class index has no configured name.
pub const UNDEFINED_LABEL: &str = "Undefined";

/// Number of leading fields per row: center-x, center-y, width, height, objectness.
pub const BOX_FIELDS: usize = 5;

/// Per-tensor affine quantization parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantization {
    pub scale: f32,
    pub zero_point: f32,
}

impl Quantization {
    pub fn new(scale: f32, zero_point: f32) -> Self {
        Self { scale, zero_point }
    }

    pub fn dequantize(&self, raw: u8) -> f32 {
        (raw as f32 - self.zero_point) * self.scale
    }
}

impl Default for Quantization {
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

/// Output tensor layout: `boxes` rows of `5 + classes` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorLayout {
    pub boxes: usize,
    pub classes: usize,
}

impl TensorLayout {
    pub fn new(boxes: usize, classes: usize) -> Self {
        Self { boxes, classes }
    }

    pub fn row_len(&self) -> usize {
        BOX_FIELDS + self.classes
    }

    pub fn expected_len(&self) -> usize {
        self.boxes * self.row_len()
    }
}

/// Process-wide source of detection reference ids.
///
/// Ids start at 1, strictly increase, and are only rewound by building a new
/// counter on pipeline reset.
#[derive(Debug)]
pub struct RefIdCounter {
    next: u64,
}

impl RefIdCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }

    /// The id the next detection will receive.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for RefIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a quantized detector output tensor into candidate detections.
#[derive(Clone, Debug)]
pub struct BoxDecoder {
    layout: TensorLayout,
    quant: Quantization,
    objectness_threshold: f32,
    confidence_threshold: f32,
    labels: Vec<String>,
}

impl BoxDecoder {
    pub fn new(layout: TensorLayout, quant: Quantization) -> Self {
        Self {
            layout,
            quant,
            objectness_threshold: 0.25,
            confidence_threshold: 0.30,
            labels: Vec::new(),
        }
    }

    pub fn with_thresholds(mut self, objectness: f32, confidence: f32) -> Self {
        self.objectness_threshold = objectness;
        self.confidence_threshold = confidence;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    /// Decode every row of `tensor`.
    ///
    /// Each emitted detection gets a fresh ref id and `timestamp_ms`, whether or
    /// not it later survives suppression. A short tensor is decoded up to its
    /// last complete row.
    pub fn decode(
        &self,
        tensor: &[u8],
        ref_ids: &mut RefIdCounter,
        timestamp_ms: u64,
    ) -> Vec<Detection> {
        let row_len = self.layout.row_len();
        let expected = self.layout.expected_len();
        if tensor.len() < expected {
            warn!(
                "output tensor holds {} bytes, layout expects {}; decoding complete rows only",
                tensor.len(),
                expected
            );
        }

        let mut detections = Vec::new();
        for row in tensor.chunks_exact(row_len).take(self.layout.boxes) {
            let objectness = self.quant.dequantize(row[4]);
            if objectness < self.objectness_threshold {
                continue;
            }

            let cx = self.quant.dequantize(row[0]);
            let cy = self.quant.dequantize(row[1]);
            let w = self.quant.dequantize(row[2]);
            let h = self.quant.dequantize(row[3]);

            let mut class_id: Option<usize> = None;
            let mut max_confidence = 0.0f32;
            for (class, raw) in row[BOX_FIELDS..].iter().enumerate() {
                let confidence = self.quant.dequantize(*raw) * objectness;
                if confidence > max_confidence {
                    class_id = Some(class);
                    max_confidence = confidence;
                }
            }

            if max_confidence <= self.confidence_threshold {
                continue;
            }

            let label = class_id
                .and_then(|id| self.labels.get(id))
                .map(String::as_str)
                .unwrap_or(UNDEFINED_LABEL);

            detections.push(
                Detection::new(label, max_confidence, cx - w / 2.0, cy - h / 2.0, w, h)
                    .with_timestamp(timestamp_ms)
                    .with_ref_id(ref_ids.next_id()),
            );
        }

        debug!("decoded {} candidate boxes", detections.len());
        detections
    }
}
