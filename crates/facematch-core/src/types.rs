use serde::{Deserialize, Serialize};
use std::fmt;

/// Axis-aligned face rectangle in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32, confidence: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// True when all edges are finite and `right > left`, `bottom > top`.
    pub fn is_valid(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|v| v.is_finite())
            && self.right > self.left
            && self.bottom > self.top
    }
}

/// Integer pixel rectangle a face crop was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Which of the two compared photos a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Id,
    Profile,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::Id => f.write_str("ID"),
            ImageRole::Profile => f.write_str("profile"),
        }
    }
}

/// Status of the comparison state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonStatus {
    Idle,
    Processing,
    Match,
    NoMatch,
    Error,
}

impl ComparisonStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComparisonStatus::Match | ComparisonStatus::NoMatch | ComparisonStatus::Error
        )
    }
}

/// The four processing steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcessingStep {
    LoadImages = 1,
    ExtractFaces = 2,
    AnalyzeFeatures = 3,
    CompareResults = 4,
}

impl ProcessingStep {
    pub const COUNT: u8 = 4;

    pub fn number(self) -> u8 {
        self as u8
    }

    /// Human-readable step name for progress display.
    pub fn label(self) -> &'static str {
        match self {
            ProcessingStep::LoadImages => "Upload Images",
            ProcessingStep::ExtractFaces => "Extract Faces",
            ProcessingStep::AnalyzeFeatures => "Analyze Features",
            ProcessingStep::CompareResults => "Compare Results",
        }
    }
}

/// Snapshot of pipeline progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub step: ProcessingStep,
    pub status: ComparisonStatus,
}

impl ProcessingState {
    pub const IDLE: ProcessingState = ProcessingState {
        step: ProcessingStep::LoadImages,
        status: ComparisonStatus::Idle,
    };

    pub fn is_complete(&self) -> bool {
        matches!(self.status, ComparisonStatus::Match | ComparisonStatus::NoMatch)
    }

    pub fn has_error(&self) -> bool {
        self.status == ComparisonStatus::Error
    }
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::IDLE
    }
}
