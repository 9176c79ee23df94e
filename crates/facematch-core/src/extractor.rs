//! Padded face crops.
//!
//! The detector's box is widened by 20% on every side, clamped to the
//! source image, snapped to whole pixels, and copied out. No resampling
//! happens here; the scorer canonicalizes crop sizes.

use crate::raster::PixelImage;
use crate::types::{CropRegion, FaceBox};
use std::path::Path;
use thiserror::Error;

/// Fraction of the box size added on each side.
const FACE_PADDING: f32 = 0.2;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("degenerate face box: {0:?}")]
    DegenerateBox(FaceBox),
    #[error("face box {face:?} lies outside the {width}x{height} image")]
    OutOfBounds {
        face: FaceBox,
        width: u32,
        height: u32,
    },
}

/// A padded crop around a detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFace {
    image: PixelImage,
    region: CropRegion,
    face: FaceBox,
}

impl ExtractedFace {
    pub fn image(&self) -> &PixelImage {
        &self.image
    }

    /// Where in the source image the crop was taken.
    pub fn region(&self) -> CropRegion {
        self.region
    }

    /// The detector box the crop was built around.
    pub fn face_box(&self) -> FaceBox {
        self.face
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Write the crop to `path`; the format follows the file extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
        self.image.to_rgba_image().save(path)
    }
}

/// Padded crop rectangle for `face` inside a `width` × `height` image.
///
/// Returns `None` when the box is degenerate or entirely outside the image.
pub fn padded_region(face: &FaceBox, width: u32, height: u32) -> Option<CropRegion> {
    if !face.is_valid() {
        return None;
    }
    let (img_w, img_h) = (width as f32, height as f32);
    if face.right <= 0.0 || face.bottom <= 0.0 || face.left >= img_w || face.top >= img_h {
        return None;
    }

    let w = face.width();
    let h = face.height();
    let padded_x = (face.left - FACE_PADDING * w).max(0.0);
    let padded_y = (face.top - FACE_PADDING * h).max(0.0);
    let padded_w = (img_w - padded_x).min(w * (1.0 + 2.0 * FACE_PADDING));
    let padded_h = (img_h - padded_y).min(h * (1.0 + 2.0 * FACE_PADDING));

    let x = (padded_x.floor() as u32).min(width - 1);
    let y = (padded_y.floor() as u32).min(height - 1);
    let region_w = (padded_w.floor() as u32).clamp(1, width - x);
    let region_h = (padded_h.floor() as u32).clamp(1, height - y);

    Some(CropRegion {
        x,
        y,
        width: region_w,
        height: region_h,
    })
}

/// Cut the padded face region out of `image`.
pub fn extract(image: &PixelImage, face: &FaceBox) -> Result<ExtractedFace, ExtractionError> {
    if !face.is_valid() {
        return Err(ExtractionError::DegenerateBox(*face));
    }

    let out_of_bounds = || ExtractionError::OutOfBounds {
        face: *face,
        width: image.width(),
        height: image.height(),
    };

    let region = padded_region(face, image.width(), image.height()).ok_or_else(out_of_bounds)?;
    let crop = image.crop(region).ok_or_else(out_of_bounds)?;

    tracing::debug!(
        x = region.x,
        y = region.y,
        width = region.width,
        height = region.height,
        confidence = face.confidence,
        "extracted face region"
    );

    Ok(ExtractedFace {
        image: crop,
        region,
        face: *face,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> PixelImage {
        PixelImage::from_fn(w, h, |x, y| [(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
            .unwrap()
    }

    #[test]
    fn test_padding_centered_face() {
        let face = FaceBox::new(50.0, 50.0, 150.0, 150.0, 0.9);
        let region = padded_region(&face, 200, 200).unwrap();
        assert_eq!(region, CropRegion { x: 30, y: 30, width: 140, height: 140 });
    }

    #[test]
    fn test_padding_clamped_at_origin() {
        let face = FaceBox::new(0.0, 0.0, 100.0, 100.0, 0.9);
        let region = padded_region(&face, 120, 120).unwrap();
        assert_eq!(region, CropRegion { x: 0, y: 0, width: 120, height: 120 });
    }

    #[test]
    fn test_padding_clamped_at_far_edge() {
        let face = FaceBox::new(300.0, 10.0, 400.0, 60.0, 0.9);
        let region = padded_region(&face, 410, 100).unwrap();
        // x = 280, width = min(410 - 280, 140) = 130
        assert_eq!(region.x, 280);
        assert_eq!(region.width, 130);
        // y = 0, height = min(100, 70) = 70
        assert_eq!(region.y, 0);
        assert_eq!(region.height, 70);
    }

    #[test]
    fn test_region_never_exceeds_image() {
        let (w, h) = (64u32, 48u32);
        let boxes = [
            FaceBox::new(-30.0, -30.0, 200.0, 200.0, 0.5),
            FaceBox::new(60.0, 40.0, 63.9, 47.9, 0.5),
            FaceBox::new(0.5, 0.5, 1.0, 1.0, 0.5),
            FaceBox::new(10.3, 7.7, 33.1, 29.9, 0.5),
        ];
        for face in boxes {
            let r = padded_region(&face, w, h).unwrap();
            assert!(r.width >= 1 && r.height >= 1, "{face:?} -> {r:?}");
            assert!(r.x + r.width <= w, "{face:?} -> {r:?}");
            assert!(r.y + r.height <= h, "{face:?} -> {r:?}");
        }
    }

    #[test]
    fn test_extract_copies_source_pixels() {
        let img = checker(200, 200);
        let face = FaceBox::new(50.0, 50.0, 150.0, 150.0, 0.9);
        let extracted = extract(&img, &face).unwrap();

        assert_eq!((extracted.width(), extracted.height()), (140, 140));
        assert_eq!(extracted.image().pixel(0, 0), img.pixel(30, 30));
        assert_eq!(extracted.image().pixel(139, 139), img.pixel(169, 169));
        assert_eq!(extracted.face_box(), face);
    }

    #[test]
    fn test_extract_rejects_degenerate_box() {
        let img = checker(50, 50);
        let face = FaceBox::new(20.0, 20.0, 10.0, 30.0, 0.9);
        assert!(matches!(
            extract(&img, &face),
            Err(ExtractionError::DegenerateBox(_))
        ));
    }

    #[test]
    fn test_extract_rejects_box_outside_image() {
        let img = checker(50, 50);
        let face = FaceBox::new(60.0, 60.0, 90.0, 90.0, 0.9);
        assert!(matches!(
            extract(&img, &face),
            Err(ExtractionError::OutOfBounds { width: 50, height: 50, .. })
        ));
    }
}
