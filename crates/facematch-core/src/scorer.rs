//! Pixel-level face similarity.
//!
//! Both crops are resampled to a fixed 100×100 canvas and compared
//! position by position using the Euclidean RGB distance, normalized by
//! the largest possible distance. This is a coarse perceptual heuristic,
//! sensitive to pose, lighting and alignment, and is kept that way so the
//! match threshold keeps its meaning.

use crate::extractor::ExtractedFace;
use crate::raster::PixelImage;

/// Side length of the comparison canvas.
pub const CANONICAL_SIZE: u32 = 100;

/// A face crop resampled to `CANONICAL_SIZE` × `CANONICAL_SIZE`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFace(PixelImage);

impl CanonicalFace {
    pub fn image(&self) -> &PixelImage {
        &self.0
    }
}

pub fn canonicalize(face: &ExtractedFace) -> CanonicalFace {
    canonicalize_image(face.image())
}

pub fn canonicalize_image(image: &PixelImage) -> CanonicalFace {
    CanonicalFace(image.resize_bilinear(CANONICAL_SIZE, CANONICAL_SIZE))
}

fn max_rgb_distance() -> f64 {
    (3.0 * 255.0f64 * 255.0).sqrt()
}

/// Mean per-pixel RGB similarity of two canonical faces, in `[0, 1]`.
///
/// Alpha is ignored. Identical inputs score exactly 1.0; the result does not
/// depend on argument order.
pub fn score_canonical(a: &CanonicalFace, b: &CanonicalFace) -> f64 {
    let max_distance = max_rgb_distance();
    let mut total = 0.0f64;
    let mut count = 0usize;

    for (pa, pb) in a.0.pixels().zip(b.0.pixels()) {
        let squared: f64 = (0..3)
            .map(|c| {
                let d = pa[c] as f64 - pb[c] as f64;
                d * d
            })
            .sum();
        total += 1.0 - squared.sqrt() / max_distance;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }
    (total / count as f64).clamp(0.0, 1.0)
}

/// Canonicalize both faces and score them.
pub fn score(a: &ExtractedFace, b: &ExtractedFace) -> f64 {
    score_canonical(&canonicalize(a), &canonicalize(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(w: u32, h: u32, seed: u32) -> PixelImage {
        PixelImage::from_fn(w, h, |x, y| {
            let v = x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17)).wrapping_add(seed);
            [(v % 256) as u8, ((v / 3) % 256) as u8, ((v * 7) % 256) as u8, 255]
        })
        .unwrap()
    }

    fn canon(img: &PixelImage) -> CanonicalFace {
        canonicalize_image(img)
    }

    #[test]
    fn test_canonical_size() {
        let c = canon(&pattern(37, 81, 0));
        assert_eq!((c.image().width(), c.image().height()), (CANONICAL_SIZE, CANONICAL_SIZE));
    }

    #[test]
    fn test_reflexive_exactly_one() {
        for img in [pattern(100, 100, 1), pattern(13, 250, 2), pattern(640, 480, 3)] {
            let c = canon(&img);
            assert_eq!(score_canonical(&c, &c), 1.0);
        }
    }

    #[test]
    fn test_symmetric() {
        let a = canon(&pattern(120, 90, 5));
        let b = canon(&pattern(64, 64, 99));
        assert_eq!(score_canonical(&a, &b), score_canonical(&b, &a));
    }

    #[test]
    fn test_bounded() {
        let images = [
            pattern(50, 50, 0),
            pattern(200, 100, 77),
            PixelImage::filled(10, 10, [0, 0, 0, 255]).unwrap(),
            PixelImage::filled(10, 10, [255, 255, 255, 0]).unwrap(),
        ];
        for a in &images {
            for b in &images {
                let s = score_canonical(&canon(a), &canon(b));
                assert!((0.0..=1.0).contains(&s), "score {s} out of range");
            }
        }
    }

    #[test]
    fn test_opposite_colors_score_zero() {
        let black = canon(&PixelImage::filled(100, 100, [0, 0, 0, 255]).unwrap());
        let white = canon(&PixelImage::filled(100, 100, [255, 255, 255, 255]).unwrap());
        assert_eq!(score_canonical(&black, &white), 0.0);
    }

    #[test]
    fn test_same_content_different_sizes() {
        let small = canon(&PixelImage::filled(40, 60, [90, 120, 200, 255]).unwrap());
        let large = canon(&PixelImage::filled(300, 280, [90, 120, 200, 255]).unwrap());
        assert_eq!(score_canonical(&small, &large), 1.0);
    }

    #[test]
    fn test_alpha_ignored() {
        let opaque = canon(&PixelImage::filled(100, 100, [10, 20, 30, 255]).unwrap());
        let clear = canon(&PixelImage::filled(100, 100, [10, 20, 30, 0]).unwrap());
        assert_eq!(score_canonical(&opaque, &clear), 1.0);
    }

    #[test]
    fn test_single_channel_difference() {
        // One channel differs by 255: distance = 255 / (255 * sqrt(3)).
        let a = canon(&PixelImage::filled(100, 100, [0, 0, 0, 255]).unwrap());
        let b = canon(&PixelImage::filled(100, 100, [255, 0, 0, 255]).unwrap());
        let expected = 1.0 - 1.0 / 3.0f64.sqrt();
        assert!((score_canonical(&a, &b) - expected).abs() < 1e-9);
    }
}
