use anyhow::{anyhow, Result};

use super::{rgb_len, RGB_CHANNELS};

/// Pixel layouts accepted from the frame source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    /// Full-resolution Y plane followed by an interleaved UV plane subsampled 2x2.
    Nv12,
}

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            if pixels.len() != expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            Ok(pixels.to_vec())
        }
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
    }
}

/// Plane geometry of an NV12 buffer.
///
/// Chroma dimensions round up, so an odd last column or row still has its own
/// UV sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Nv12Layout {
    width: usize,
    luma_len: usize,
    chroma_stride: usize,
    total_len: usize,
}

impl Nv12Layout {
    fn new(width: u32, height: u32) -> Result<Self> {
        let overflow = || anyhow!("NV12 frame dimensions overflow");
        let w = width as usize;
        let h = height as usize;
        let luma_len = w.checked_mul(h).ok_or_else(overflow)?;
        let chroma_stride = w.div_ceil(2).checked_mul(2).ok_or_else(overflow)?;
        let chroma_len = chroma_stride.checked_mul(h.div_ceil(2)).ok_or_else(overflow)?;
        let total_len = luma_len.checked_add(chroma_len).ok_or_else(overflow)?;
        Ok(Self {
            width: w,
            luma_len,
            chroma_stride,
            total_len,
        })
    }

    fn chroma_offset(&self, col: usize, row: usize) -> usize {
        self.luma_len + (row / 2) * self.chroma_stride + (col / 2) * 2
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let layout = Nv12Layout::new(width, height)?;
    if pixels.len() != layout.total_len {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {} for {}x{}, got {}",
            layout.total_len,
            width,
            height,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; rgb_len(width, height)?];
    if layout.width == 0 {
        return Ok(rgb);
    }
    for (index, (out, luma)) in rgb
        .chunks_exact_mut(RGB_CHANNELS)
        .zip(&pixels[..layout.luma_len])
        .enumerate()
    {
        let uv = layout.chroma_offset(index % layout.width, index / layout.width);
        out.copy_from_slice(&yuv_to_rgb(*luma, pixels[uv], pixels[uv + 1]));
    }
    Ok(rgb)
}

/// BT.601 full-range conversion.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
