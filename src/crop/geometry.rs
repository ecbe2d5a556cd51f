use crate::detect::{Detection, COORDINATE_SPACE};
use crate::frame::PixelRect;

/// Extra pixels added around a detection before cropping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Borders {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Where to cut, and where the detection sits inside the cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropGeometry {
    /// Crop rectangle in source pixels.
    pub crop: PixelRect,
    /// Detection rectangle relative to the crop origin.
    pub detection: PixelRect,
}

/// Compute the crop for `det` (public `[0,1000]` geometry) on a
/// `source_width x source_height` frame.
///
/// The crop always lies inside the source and the relative detection box
/// inside the crop; both are at least 1x1. Returns `None` for an empty source
/// or non-finite geometry.
pub fn compute_crop(
    det: &Detection,
    source_width: u32,
    source_height: u32,
    borders: &Borders,
) -> Option<CropGeometry> {
    if source_width == 0 || source_height == 0 || !det.has_finite_geometry() {
        return None;
    }
    let sw = source_width as i64;
    let sh = source_height as i64;

    let det_x = to_pixels(det.x, sw);
    let det_y = to_pixels(det.y, sh);
    let det_w = to_pixels(det.w, sw);
    let det_h = to_pixels(det.h, sh);

    let (crop_x, crop_w) = clamp_span(
        det_x - borders.left as i64,
        det_w
            .saturating_add(borders.left as i64)
            .saturating_add(borders.right as i64),
        sw,
    );
    let (crop_y, crop_h) = clamp_span(
        det_y - borders.top as i64,
        det_h
            .saturating_add(borders.top as i64)
            .saturating_add(borders.bottom as i64),
        sh,
    );

    let (rel_x, rel_w) = clamp_span(det_x - crop_x, det_w, crop_w);
    let (rel_y, rel_h) = clamp_span(det_y - crop_y, det_h, crop_h);

    Some(CropGeometry {
        crop: rect(crop_x, crop_y, crop_w, crop_h),
        detection: rect(rel_x, rel_y, rel_w, rel_h),
    })
}

/// Out-of-range coordinates are clamped into the public space first, so the
/// result never exceeds `extent`.
fn to_pixels(value: f32, extent: i64) -> i64 {
    let value = (value as f64).clamp(0.0, COORDINATE_SPACE as f64);
    (value * extent as f64 / COORDINATE_SPACE as f64).round() as i64
}

/// Clamp a `[start, start + len)` span into `[0, limit)` with `len >= 1`.
fn clamp_span(mut start: i64, mut len: i64, limit: i64) -> (i64, i64) {
    if start < 0 {
        len = len.saturating_add(start);
        start = 0;
    }
    start = start.min(limit - 1);
    if start.saturating_add(len) > limit {
        len = limit - start;
    }
    (start, len.max(1))
}

fn rect(x: i64, y: i64, w: i64, h: i64) -> PixelRect {
    PixelRect::new(x as u32, y as u32, w as u32, h as u32)
}
