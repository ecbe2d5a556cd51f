mod backend;
mod backends;
mod decoder;
mod nms;
mod normalize;
mod result;

pub use backend::InferenceBackend;
pub use backends::{ReplayBackend, ReplayStep};
pub use decoder::{BoxDecoder, Quantization, RefIdCounter, TensorLayout, UNDEFINED_LABEL};
pub use nms::{iou, suppress};
pub use normalize::Normalizer;
pub use result::{Detection, COORDINATE_SPACE};
