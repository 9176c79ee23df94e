//! Four-step comparison state machine.
//!
//! `Idle → Processing(1..4) → Match | NoMatch`, or `Error` from any step.
//! Progress is published on a `watch` channel and notifications on a
//! `broadcast` channel; the caller always gets a [`ComparisonResult`], never
//! an error or a panic.

use crate::detector::{select_face, DetectorError, DetectorService, ModelHandle, ModelState};
use crate::extractor::{self, ExtractedFace, ExtractionError};
use crate::quality::{self, QualityAssessment};
use crate::raster::{decode_image, DecodeError, ImageSource, PixelImage};
use crate::scorer;
use crate::types::{ComparisonStatus, ImageRole, ProcessingState, ProcessingStep};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Similarity at or above which two faces are declared a match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.70;

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum ComparisonError {
    #[error("failed to load facial recognition model: {0}")]
    ModelLoad(#[source] DetectorError),
    #[error("could not load {which} image: {source}")]
    ImageDecode {
        which: ImageRole,
        #[source]
        source: DecodeError,
    },
    #[error("face detection failed on {which} image: {source}")]
    Detection {
        which: ImageRole,
        #[source]
        source: DetectorError,
    },
    #[error("No face detected in {which} image")]
    NoFaceDetected { which: ImageRole },
    #[error("could not extract face from {which} image: {source}")]
    Extraction {
        which: ImageRole,
        #[source]
        source: ExtractionError,
    },
    #[error("{reason}")]
    QualityRejected { reason: String },
    #[error("comparison cancelled")]
    Cancelled,
    #[error("Unknown error occurred: {message}")]
    Unknown { message: String },
}

/// Notifications for whoever renders progress to a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ModelLoading,
    ModelLoaded,
    ModelLoadFailed { message: String },
    /// Non-fatal: the largest face was used.
    MultipleFaces { which: ImageRole, count: usize },
    NoFaceDetected { which: ImageRole },
    Completed { status: ComparisonStatus, confidence: f64 },
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub match_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Outcome of one comparison run.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub status: ComparisonStatus,
    /// Similarity in `[0, 1]`; 0 on error.
    pub confidence: f64,
    pub id_face: Option<ExtractedFace>,
    pub profile_face: Option<ExtractedFace>,
    pub error: Option<String>,
}

impl ComparisonResult {
    pub fn idle() -> Self {
        Self {
            status: ComparisonStatus::Idle,
            confidence: 0.0,
            id_face: None,
            profile_face: None,
            error: None,
        }
    }

    fn failed(err: &ComparisonError) -> Self {
        Self {
            status: ComparisonStatus::Error,
            error: Some(err.to_string()),
            ..Self::idle()
        }
    }

    pub fn is_match(&self) -> bool {
        self.status == ComparisonStatus::Match
    }
}

/// Faces and score produced by a successful run.
struct Scored {
    id_face: ExtractedFace,
    profile_face: ExtractedFace,
    similarity: f64,
}

/// Orchestrates quality gating, detection, extraction and scoring.
pub struct ComparisonPipeline {
    detector: Arc<DetectorService>,
    config: PipelineConfig,
    progress: watch::Sender<ProcessingState>,
    events: broadcast::Sender<PipelineEvent>,
    /// Bumped on every new run and on reset; runs holding an older value are stale.
    generation: AtomicU64,
    last_result: Mutex<Option<ComparisonResult>>,
}

impl ComparisonPipeline {
    pub fn new(detector: Arc<DetectorService>, config: PipelineConfig) -> Self {
        let (progress, _) = watch::channel(ProcessingState::IDLE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            detector,
            config,
            progress,
            events,
            generation: AtomicU64::new(0),
            last_result: Mutex::new(None),
        }
    }

    pub fn detector(&self) -> &Arc<DetectorService> {
        &self.detector
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Quality-gate an identity-document image. Does not touch progress.
    pub fn submit_quality_check(&self, image: &PixelImage) -> QualityAssessment {
        let assessment = quality::assess(image);
        match &assessment.reason {
            None => tracing::debug!(
                width = image.width(),
                height = image.height(),
                "ID image passed quality check"
            ),
            Some(reason) => tracing::info!(
                width = image.width(),
                height = image.height(),
                reason = %reason,
                "ID image rejected by quality check"
            ),
        }
        assessment
    }

    /// Current progress snapshot.
    pub fn observe_progress(&self) -> ProcessingState {
        *self.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProcessingState> {
        self.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Most recent terminal result of a run that was not reset away.
    pub fn last_result(&self) -> Option<ComparisonResult> {
        self.lock_last_result().clone()
    }

    /// Return to `{step 1, Idle}` and forget the last result.
    ///
    /// A run still in flight keeps executing, but its progress updates and
    /// result are no longer published.
    pub fn reset(&self) {
        // Under the progress lock, so no run can publish between the bump and the write.
        self.progress.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::AcqRel);
            *state = ProcessingState::IDLE;
            *self.lock_last_result() = None;
        });
        tracing::debug!("pipeline reset");
    }

    /// Load the detection model ahead of the first comparison.
    pub async fn preload(&self) -> Result<(), ComparisonError> {
        self.load_model().await.map(|_| ())
    }

    /// Compare the faces in an ID photo and a profile photo.
    pub async fn run_comparison(
        &self,
        id: impl Into<ImageSource>,
        profile: impl Into<ImageSource>,
    ) -> ComparisonResult {
        let generation = self.begin_run();
        let outcome = self.guarded(generation, id.into(), profile.into()).await;
        self.finish(generation, outcome)
    }

    /// Like [`run_comparison`](Self::run_comparison), but gives up as soon as
    /// `cancel` completes, resolving to an `Error` result.
    pub async fn run_comparison_until<F>(
        &self,
        id: impl Into<ImageSource>,
        profile: impl Into<ImageSource>,
        cancel: F,
    ) -> ComparisonResult
    where
        F: Future<Output = ()>,
    {
        let generation = self.begin_run();
        let outcome = tokio::select! {
            outcome = self.guarded(generation, id.into(), profile.into()) => outcome,
            _ = cancel => Err(ComparisonError::Cancelled),
        };
        self.finish(generation, outcome)
    }

    fn begin_run(&self) -> u64 {
        let mut generation = 0;
        self.progress.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *state = ProcessingState {
                step: ProcessingStep::LoadImages,
                status: ComparisonStatus::Processing,
            };
        });
        tracing::info!(generation, "comparison started");
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Publish `step`, then yield so observers on this thread see it.
    async fn advance(&self, generation: u64, step: ProcessingStep) {
        let published = self.progress.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            *state = ProcessingState {
                step,
                status: ComparisonStatus::Processing,
            };
            true
        });
        if published {
            tracing::debug!(step = step.number(), name = step.label(), "processing step");
        }
        tokio::task::yield_now().await;
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_last_result(&self) -> std::sync::MutexGuard<'_, Option<ComparisonResult>> {
        self.last_result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load_model(&self) -> Result<ModelHandle, ComparisonError> {
        let was_ready = self.detector.state() == ModelState::Ready;
        if !was_ready {
            self.emit(PipelineEvent::ModelLoading);
        }

        match self.detector.ensure_loaded().await {
            Ok(handle) => {
                if !was_ready {
                    self.emit(PipelineEvent::ModelLoaded);
                }
                Ok(handle)
            }
            Err(e) => {
                self.emit(PipelineEvent::ModelLoadFailed {
                    message: e.to_string(),
                });
                Err(ComparisonError::ModelLoad(e))
            }
        }
    }

    /// Run the steps, turning a panic anywhere inside them into an error.
    async fn guarded(
        &self,
        generation: u64,
        id: ImageSource,
        profile: ImageSource,
    ) -> Result<Scored, ComparisonError> {
        AssertUnwindSafe(self.execute(generation, id, profile))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(%message, "comparison panicked");
                Err(ComparisonError::Unknown { message })
            })
    }

    async fn execute(
        &self,
        generation: u64,
        id: ImageSource,
        profile: ImageSource,
    ) -> Result<Scored, ComparisonError> {
        tokio::task::yield_now().await;

        // Step 1: decode both photos while the model loads; the first failure wins.
        let (handle, id_image, profile_image) = tokio::try_join!(
            self.load_model(),
            decode_as(ImageRole::Id, id),
            decode_as(ImageRole::Profile, profile),
        )?;

        // Step 2
        self.advance(generation, ProcessingStep::ExtractFaces).await;
        let (id_face, profile_face) = tokio::try_join!(
            self.locate_face(ImageRole::Id, &id_image, &handle),
            self.locate_face(ImageRole::Profile, &profile_image, &handle),
        )?;

        // Step 3
        self.advance(generation, ProcessingStep::AnalyzeFeatures).await;
        let id_canonical = scorer::canonicalize(&id_face);
        let profile_canonical = scorer::canonicalize(&profile_face);

        // Step 4
        self.advance(generation, ProcessingStep::CompareResults).await;
        let similarity = scorer::score_canonical(&id_canonical, &profile_canonical);

        Ok(Scored {
            id_face,
            profile_face,
            similarity,
        })
    }

    async fn locate_face(
        &self,
        which: ImageRole,
        image: &PixelImage,
        handle: &ModelHandle,
    ) -> Result<ExtractedFace, ComparisonError> {
        let boxes = self
            .detector
            .detect(image, handle)
            .await
            .map_err(|source| ComparisonError::Detection { which, source })?;

        let Some(selection) = select_face(&boxes) else {
            tracing::warn!(%which, "no face detected");
            self.emit(PipelineEvent::NoFaceDetected { which });
            return Err(ComparisonError::NoFaceDetected { which });
        };

        if selection.is_ambiguous() {
            tracing::warn!(
                %which,
                count = selection.candidates,
                "multiple faces detected, using the largest"
            );
            self.emit(PipelineEvent::MultipleFaces {
                which,
                count: selection.candidates,
            });
        }

        extractor::extract(image, &selection.face)
            .map_err(|source| ComparisonError::Extraction { which, source })
    }

    fn finish(&self, generation: u64, outcome: Result<Scored, ComparisonError>) -> ComparisonResult {
        let result = match outcome {
            Ok(scored) => {
                let matched = scored.similarity >= self.config.match_threshold;
                tracing::info!(
                    similarity = scored.similarity,
                    threshold = self.config.match_threshold,
                    matched,
                    "comparison finished"
                );
                ComparisonResult {
                    status: if matched {
                        ComparisonStatus::Match
                    } else {
                        ComparisonStatus::NoMatch
                    },
                    confidence: scored.similarity,
                    id_face: Some(scored.id_face),
                    profile_face: Some(scored.profile_face),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "comparison failed");
                ComparisonResult::failed(&e)
            }
        };

        let published = self.progress.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            state.status = result.status;
            *self.lock_last_result() = Some(result.clone());
            true
        });
        if !published {
            tracing::debug!(generation, "discarding result of a reset comparison");
            return result;
        }

        self.emit(match &result.error {
            Some(message) => PipelineEvent::Failed {
                message: message.clone(),
            },
            None => PipelineEvent::Completed {
                status: result.status,
                confidence: result.confidence,
            },
        });

        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

async fn decode_as(which: ImageRole, source: ImageSource) -> Result<PixelImage, ComparisonError> {
    decode_image(source)
        .await
        .map_err(|source| ComparisonError::ImageDecode { which, source })
}
