//! Face detection capability and its lazily loaded, shared model.
//!
//! [`FaceDetectionModel`] is the narrow seam to whatever actually localizes
//! faces (the SCRFD backend in [`crate::scrfd`], or a test double).
//! [`DetectorService`] owns the load lifecycle
//! (`uninitialized → loading → ready`) and guarantees that concurrent
//! callers share a single in-flight load.

use crate::raster::PixelImage;
use crate::types::FaceBox;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model handle does not belong to this detector")]
    ForeignHandle,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Opaque reference to a loaded detection model.
///
/// Clones share the same underlying model.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ModelHandle {
    pub fn new<T: Any + Send + Sync>(model: T) -> Self {
        Self {
            inner: Arc::new(model),
        }
    }

    /// Borrow the backend-specific model behind this handle.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// True when both handles refer to the same loaded model.
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelHandle")
            .field(&(Arc::as_ptr(&self.inner) as *const ()))
            .finish()
    }
}

/// A face localization capability.
#[async_trait]
pub trait FaceDetectionModel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "face-detector"
    }

    /// Load the model. Called at most once per [`DetectorService`] until invalidated.
    async fn load(&self) -> Result<ModelHandle, DetectorError>;

    /// Locate faces in `image`, in its own pixel coordinates.
    async fn estimate(
        &self,
        image: &PixelImage,
        handle: &ModelHandle,
    ) -> Result<Vec<FaceBox>, DetectorError>;
}

/// Load lifecycle of a [`DetectorService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
}

impl ModelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ModelState::Loading,
            2 => ModelState::Ready,
            _ => ModelState::Uninitialized,
        }
    }
}

/// Shared, lazily loaded detector.
///
/// The handle slot's lock is held for the duration of a load, so a second
/// `ensure_loaded` issued while the first is in flight waits on that same
/// load and then receives the cached handle.
pub struct DetectorService {
    model: Arc<dyn FaceDetectionModel>,
    handle: Mutex<Option<ModelHandle>>,
    state: AtomicU8,
}

impl DetectorService {
    pub fn new(model: Arc<dyn FaceDetectionModel>) -> Self {
        Self {
            model,
            handle: Mutex::new(None),
            state: AtomicU8::new(ModelState::Uninitialized as u8),
        }
    }

    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ModelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Return the cached handle, loading the model first if needed.
    ///
    /// A failed load leaves the service uninitialized; it is not retried
    /// until the next call.
    pub async fn ensure_loaded(&self) -> Result<ModelHandle, DetectorError> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        self.set_state(ModelState::Loading);
        tracing::info!(model = self.model.name(), "loading face detection model");
        // Dropping this future mid-load must not leave the state at Loading.
        let mut loading = LoadingGuard {
            state: &self.state,
            armed: true,
        };

        let loaded = self.model.load().await;
        loading.armed = false;

        match loaded {
            Ok(handle) => {
                *slot = Some(handle.clone());
                self.set_state(ModelState::Ready);
                tracing::info!(model = self.model.name(), "face detection model ready");
                Ok(handle)
            }
            Err(e) => {
                self.set_state(ModelState::Uninitialized);
                tracing::error!(model = self.model.name(), error = %e, "face detection model failed to load");
                Err(e)
            }
        }
    }

    /// Drop the cached handle; the next `ensure_loaded` reloads.
    pub async fn invalidate(&self) {
        let mut slot = self.handle.lock().await;
        if slot.take().is_some() {
            tracing::info!(model = self.model.name(), "face detection model invalidated");
        }
        self.set_state(ModelState::Uninitialized);
    }

    pub async fn detect(
        &self,
        image: &PixelImage,
        handle: &ModelHandle,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let boxes = self.model.estimate(image, handle).await?;
        tracing::debug!(
            faces = boxes.len(),
            width = image.width(),
            height = image.height(),
            "detection finished"
        );
        Ok(boxes)
    }
}

struct LoadingGuard<'a> {
    state: &'a AtomicU8,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state
                .store(ModelState::Uninitialized as u8, Ordering::Release);
        }
    }
}

/// The face chosen from a detector's output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceSelection {
    pub face: FaceBox,
    /// How many faces the detector reported.
    pub candidates: usize,
}

impl FaceSelection {
    pub fn is_ambiguous(&self) -> bool {
        self.candidates > 1
    }
}

/// Pick the largest box by area; ties keep the first one. `None` when empty.
pub fn select_face(boxes: &[FaceBox]) -> Option<FaceSelection> {
    let mut best: Option<&FaceBox> = None;
    for candidate in boxes {
        match best {
            Some(current) if candidate.area() <= current.area() => {}
            _ => best = Some(candidate),
        }
    }

    best.map(|face| FaceSelection {
        face: *face,
        candidates: boxes.len(),
    })
}
