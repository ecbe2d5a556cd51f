use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::crop::encoder::{JpegEncode, JPEG_QUALITY};
use crate::crop::geometry::{compute_crop, Borders};
use crate::detect::Detection;
use crate::frame::{PixelRect, RgbFrame};

/// Fixed crop cache capacity.
pub const MAX_CACHED_CROPS: usize = 5;

/// Crop evidence for one detection. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evidence {
    pub ref_id: u64,
    /// Crop rectangle in source pixels.
    pub crop: PixelRect,
    /// Detection rectangle relative to the crop origin.
    pub detection: PixelRect,
    /// Crop width in pixels.
    pub width: u32,
    /// Crop height in pixels.
    pub height: u32,
    pub jpeg: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropSettings {
    pub active: bool,
    pub borders: Borders,
}

/// Lazily populated crop cache keyed by detection ref id.
///
/// Once `capacity` entries exist, further misses are not encoded or stored and
/// return `None`; existing entries are never evicted. The driver resets the
/// cache once per inference cycle.
#[derive(Debug)]
pub struct CropCache {
    settings: CropSettings,
    capacity: usize,
    entries: HashMap<u64, Arc<Evidence>>,
}

impl CropCache {
    pub fn new(settings: CropSettings) -> Self {
        Self::with_capacity(settings, MAX_CACHED_CROPS)
    }

    pub fn with_capacity(settings: CropSettings, capacity: usize) -> Self {
        Self {
            settings,
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn settings(&self) -> CropSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: CropSettings) {
        self.settings = settings;
    }

    /// Evidence for `det`, encoding it from `frame` on first request.
    ///
    /// Returns `None` without side effects when cropping is disabled, the
    /// detection has no ref id, the cache is full, the frame is missing, or
    /// encoding fails.
    pub fn get_evidence(
        &mut self,
        det: &Detection,
        frame: Option<&RgbFrame>,
        encoder: &dyn JpegEncode,
    ) -> Option<Arc<Evidence>> {
        if !self.settings.active {
            return None;
        }
        let Some(ref_id) = det.ref_id else {
            warn!("detection '{}' has no refId; no crop evidence", det.label);
            return None;
        };
        if let Some(hit) = self.entries.get(&ref_id) {
            return Some(Arc::clone(hit));
        }
        if self.entries.len() >= self.capacity {
            debug!("crop cache full; refId {} not cached", ref_id);
            return None;
        }

        let Some(frame) = frame else {
            warn!("no source frame for refId {}", ref_id);
            return None;
        };
        let Some(geometry) = compute_crop(det, frame.width, frame.height, &self.settings.borders)
        else {
            warn!("refId {} has unusable geometry", ref_id);
            return None;
        };

        let pixels = match frame.crop_region(geometry.crop) {
            Ok(pixels) => pixels,
            Err(err) => {
                warn!("failed to crop refId {}: {}", ref_id, err);
                return None;
            }
        };
        let jpeg = match encoder.encode_jpeg(&pixels, geometry.crop.w, geometry.crop.h, JPEG_QUALITY)
        {
            Ok(jpeg) if !jpeg.is_empty() => jpeg,
            Ok(_) => {
                warn!("JPEG encoder returned no data for refId {}", ref_id);
                return None;
            }
            Err(err) => {
                warn!("JPEG encoding failed for refId {}: {}", ref_id, err);
                return None;
            }
        };

        let evidence = Arc::new(Evidence {
            ref_id,
            crop: geometry.crop,
            detection: geometry.detection,
            width: geometry.crop.w,
            height: geometry.crop.h,
            jpeg,
        });
        self.entries.insert(ref_id, Arc::clone(&evidence));
        Some(evidence)
    }

    pub fn contains(&self, ref_id: u64) -> bool {
        self.entries.contains_key(&ref_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every cached crop.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
