//! Full-resolution frame container.
//!
//! - `RgbFrame`: owned interleaved RGB24 buffer, validated at construction,
//!   zeroized on drop.
//! - `PixelRect`: integer pixel rectangle used for crop regions.
//!
//! Crop evidence is cut from the frame the host captured for the current
//! inference cycle; frames are never retained across cycles by this crate.

mod normalize;

use anyhow::{anyhow, Result};
use serde::Serialize;
use zeroize::Zeroize;

pub use normalize::PixelFormat;

/// Bytes per pixel of an interleaved RGB24 buffer.
pub const RGB_CHANNELS: usize = 3;

/// Rectangle in source pixel space, top-left origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.w as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.h as u64
    }
}

/// Interleaved RGB24 frame.
pub struct RgbFrame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Build a frame from a camera buffer in `format`.
    pub fn from_pixels(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let data = normalize::normalize_to_rgb(pixels, width, height, format)?;
        Self::new(data, width, height)
    }

    pub fn from_nv12(pixels: &[u8], width: u32, height: u32) -> Result<Self> {
        Self::from_pixels(pixels, width, height, PixelFormat::Nv12)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Copy `region` out as a tightly packed RGB24 buffer.
    pub fn crop_region(&self, region: PixelRect) -> Result<Vec<u8>> {
        if region.w == 0 || region.h == 0 {
            return Err(anyhow!("empty crop region {:?}", region));
        }
        if region.right() > self.width as u64 || region.bottom() > self.height as u64 {
            return Err(anyhow!(
                "crop region {:?} exceeds frame {}x{}",
                region,
                self.width,
                self.height
            ));
        }

        let stride = self.width as usize * RGB_CHANNELS;
        let row_bytes = region.w as usize * RGB_CHANNELS;
        let mut out = Vec::with_capacity(row_bytes * region.h as usize);
        for row in region.y as usize..(region.y + region.h) as usize {
            let start = row * stride + region.x as usize * RGB_CHANNELS;
            out.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(out)
    }
}

impl Drop for RgbFrame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for RgbFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}
