//! Crop evidence.
//!
//! Crops are cut from the full-resolution frame around a detection, JPEG
//! encoded, and cached by `refId` so every consumer of one cycle sees the
//! same bytes.

mod cache;
mod encoder;
mod geometry;

pub use cache::{CropCache, CropSettings, Evidence, MAX_CACHED_CROPS};
pub use encoder::{ImageJpegEncoder, JpegEncode, JPEG_QUALITY};
pub use geometry::{compute_crop, Borders, CropGeometry};
