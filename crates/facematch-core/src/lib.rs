//! facematch-core: client-side ID photo to profile photo face comparison.
//!
//! Quality-gates the identity document photo, localizes faces with a
//! pluggable detector (SCRFD via ONNX Runtime by default), crops padded
//! face regions, and scores them with a pixel-level similarity metric.
//! [`ComparisonPipeline`] drives the four-step state machine.

pub mod detector;
pub mod extractor;
pub mod pipeline;
pub mod quality;
pub mod raster;
pub mod scorer;
pub mod scrfd;
pub mod types;

pub use detector::{DetectorService, FaceDetectionModel, ModelHandle, ModelState};
pub use extractor::ExtractedFace;
pub use pipeline::{
    ComparisonError, ComparisonPipeline, ComparisonResult, PipelineConfig, PipelineEvent,
};
pub use quality::{QualityAssessment, QualityIssue};
pub use raster::{decode_image, ImageSource, PixelImage};
pub use scrfd::{ScrfdConfig, ScrfdModel};
pub use types::{ComparisonStatus, FaceBox, ImageRole, ProcessingState, ProcessingStep};
