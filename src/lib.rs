//! DetectX detection pipeline
//!
//! This crate turns the raw output of an on-camera object detector into a
//! filtered list of detections and debounced per-label events.
//!
//! # Architecture
//!
//! One inference cycle flows leaf first through:
//!
//! 1. **Box decoding**: dequantize the output tensor, apply objectness and
//!    confidence thresholds, pick the best class per candidate box.
//! 2. **Suppression**: pairwise IoU non-maximum suppression.
//! 3. **Normalization**: model units to the public `[0,1000]` coordinate space.
//! 4. **Event gating**: per-label LOW/HIGH state machine (speed or rolling
//!    window accuracy mode) plus a timeout sweep for falling edges.
//! 5. **Crop evidence**: on-demand JPEG crops keyed by `refId`, bounded cache.
//!
//! # Module Structure
//!
//! - `detect`: detection records, decoder, NMS, inference backend seam
//! - `frame`: full-resolution RGB frames and NV12 normalization
//! - `crop`: crop geometry, JPEG encoder seam, crop cache
//! - `events`: event gate, payloads, sinks, timeout sweeper
//! - `pipeline`: the driver owning one pipeline session
//! - `config`: file + environment configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod crop;
pub mod detect;
pub mod events;
pub mod frame;
pub mod pipeline;

pub use config::{CroppingSettings, ModelSettings, PipelineConfig};
pub use crop::{Borders, CropCache, Evidence, ImageJpegEncoder, JpegEncode};
pub use detect::{
    BoxDecoder, Detection, InferenceBackend, Quantization, RefIdCounter, ReplayBackend,
    TensorLayout,
};
pub use events::{
    spawn_expiry_sweeper, EventGate, EventSink, GateSettings, LabelState, LogSink, MemorySink,
    MqttSink, Prioritize, StateChange,
};
pub use frame::{PixelRect, RgbFrame};
pub use pipeline::{CycleReport, Pipeline};

/// Wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
