//! Image quality gate for identity-document photos.
//!
//! Checks run in a fixed order (resolution, sharpness, brightness) and the
//! first failure decides the verdict.

use crate::pipeline::ComparisonError;
use crate::raster::PixelImage;
use serde::{Deserialize, Serialize};

const MIN_TOTAL_PIXELS: usize = 300_000;
/// Summed-RGB difference above which two neighbouring pixels form an edge.
const EDGE_THRESHOLD: i32 = 50;
/// Minimum edges per hundred pixels.
const MIN_SHARPNESS_RATIO: f64 = 2.0;
const MIN_BRIGHTNESS: f64 = 30.0;
const MAX_BRIGHTNESS: f64 = 240.0;

/// Why an image failed the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    LowResolution,
    Blurry,
    TooDark,
    Overexposed,
}

impl QualityIssue {
    pub fn reason(self) -> &'static str {
        match self {
            QualityIssue::LowResolution => {
                "Image resolution too low. Please upload a higher quality image."
            }
            QualityIssue::Blurry => "Image appears blurry. Please upload a clearer image.",
            QualityIssue::TooDark => "Image too dark. Please upload a brighter image.",
            QualityIssue::Overexposed => {
                "Image overexposed. Please upload an image with better lighting."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub is_acceptable: bool,
    pub reason: Option<String>,
    pub issue: Option<QualityIssue>,
}

impl QualityAssessment {
    fn accepted() -> Self {
        Self {
            is_acceptable: true,
            reason: None,
            issue: None,
        }
    }

    fn rejected(issue: QualityIssue) -> Self {
        Self {
            is_acceptable: false,
            reason: Some(issue.reason().to_string()),
            issue: Some(issue),
        }
    }

    /// `Err(QualityRejected)` when the image was not acceptable.
    pub fn into_result(self) -> Result<(), ComparisonError> {
        match self.reason {
            Some(reason) if !self.is_acceptable => Err(ComparisonError::QualityRejected { reason }),
            _ => Ok(()),
        }
    }
}

/// Assess resolution, sharpness, and exposure of `image`.
pub fn assess(image: &PixelImage) -> QualityAssessment {
    let total_pixels = image.pixel_count();
    if total_pixels < MIN_TOTAL_PIXELS {
        return QualityAssessment::rejected(QualityIssue::LowResolution);
    }

    if sharpness_ratio(image) < MIN_SHARPNESS_RATIO {
        return QualityAssessment::rejected(QualityIssue::Blurry);
    }

    let brightness = mean_brightness(image);
    if brightness < MIN_BRIGHTNESS {
        return QualityAssessment::rejected(QualityIssue::TooDark);
    }
    if brightness > MAX_BRIGHTNESS {
        return QualityAssessment::rejected(QualityIssue::Overexposed);
    }

    QualityAssessment::accepted()
}

/// Edges per hundred pixels, comparing each pixel with the next one in
/// row-major order (row ends wrap onto the following row).
fn sharpness_ratio(image: &PixelImage) -> f64 {
    let sums: Vec<i32> = image
        .pixels()
        .map(|p| p[0] as i32 + p[1] as i32 + p[2] as i32)
        .collect();
    let edges = sums
        .windows(2)
        .filter(|pair| (pair[0] - pair[1]).abs() > EDGE_THRESHOLD)
        .count();

    edges as f64 / (image.pixel_count() as f64 / 100.0)
}

/// Mean over all pixels of the average of R, G and B.
fn mean_brightness(image: &PixelImage) -> f64 {
    let total: f64 = image
        .pixels()
        .map(|p| (p[0] as f64 + p[1] as f64 + p[2] as f64) / 3.0)
        .sum();
    total / image.pixel_count() as f64
}
