//! Face cropping with bounding-box correction.

use crate::types::BoundingBox;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CropError {
    #[error("crop is empty after clamping {bbox:?} to {width}x{height}")]
    Degenerate {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
}

/// Clamp `bbox` to the image bounds, failing if nothing is left.
pub fn correct_box(bbox: BoundingBox, width: u32, height: u32) -> Result<BoundingBox, CropError> {
    bbox.clamp(width, height)
        .ok_or(CropError::Degenerate { bbox, width, height })
}

/// Cut the face region out of `image`.
///
/// Detectors can report boxes partly outside the frame; the box is clipped
/// to the image before slicing.
pub fn crop(image: &RgbImage, bbox: BoundingBox) -> Result<RgbImage, CropError> {
    let region = correct_box(bbox, image.width(), image.height())?;
    if region != bbox {
        tracing::debug!(original = ?bbox, corrected = ?region, "clamped face box to image bounds");
    }

    // `clamp` guarantees non-negative, in-bounds values.
    Ok(image::imageops::crop_imm(
        image,
        region.x as u32,
        region.y as u32,
        region.w as u32,
        region.h as u32,
    )
    .to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn test_crop_inside() {
        let img = gradient(200, 200);
        let out = crop(&img, BoundingBox::new(10, 10, 50, 50)).unwrap();
        assert_eq!(out.dimensions(), (50, 50));
        assert_eq!(out.get_pixel(0, 0), &Rgb([10, 10, 0]));
        assert_eq!(out.get_pixel(49, 49), &Rgb([59, 59, 0]));
    }

    #[test]
    fn test_crop_negative_origin() {
        let img = gradient(200, 200);
        assert_eq!(
            correct_box(BoundingBox::new(-5, 0, 30, 30), 200, 200),
            Ok(BoundingBox::new(0, 0, 25, 30))
        );
        let out = crop(&img, BoundingBox::new(-5, 0, 30, 30)).unwrap();
        assert_eq!(out.dimensions(), (25, 30));
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_crop_past_far_edge() {
        let img = gradient(100, 80);
        let out = crop(&img, BoundingBox::new(90, 70, 40, 40)).unwrap();
        assert_eq!(out.dimensions(), (10, 10));
        assert_eq!(out.get_pixel(0, 0), &Rgb([90, 70, 0]));
    }

    #[test]
    fn test_crop_degenerate() {
        let img = gradient(100, 100);
        let err = crop(&img, BoundingBox::new(100, 0, 20, 20)).unwrap_err();
        assert!(matches!(err, CropError::Degenerate { width: 100, height: 100, .. }));
        assert!(crop(&img, BoundingBox::new(10, 10, 0, 10)).is_err());
    }
}
