use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::rgb_len;

/// Quality used for all crop evidence.
pub const JPEG_QUALITY: u8 = 90;

/// JPEG encoder seam. Input is a tightly packed RGB24 buffer.
pub trait JpegEncode: Send + Sync {
    fn encode_jpeg(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>>;
}

/// Baseline JPEG encoder backed by the `image` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageJpegEncoder;

impl JpegEncode for ImageJpegEncoder {
    fn encode_jpeg(&self, pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot encode an empty {}x{} image", width, height));
        }
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .encode(pixels, width, height, ExtendedColorType::Rgb8)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_jpeg_markers() {
        let pixels = vec![200u8; 8 * 8 * 3];
        let jpeg = ImageJpegEncoder
            .encode_jpeg(&pixels, 8, 8, JPEG_QUALITY)
            .expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(ImageJpegEncoder.encode_jpeg(&[0u8; 5], 2, 2, 90).is_err());
        assert!(ImageJpegEncoder.encode_jpeg(&[], 0, 0, 90).is_err());
    }
}
