//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the RGB input to 640×640, decodes the three anchor-free
//! stride levels, suppresses overlaps, and maps boxes back into source-image
//! pixel coordinates before returning them.

use crate::detector::{DetectorError, FaceDetectionModel, ModelHandle};
use crate::raster::PixelImage;
use crate::types::FaceBox;
use async_trait::async_trait;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Score tensors for all strides, then bbox tensors; keypoint tensors (if any) follow.
const SCRFD_MIN_OUTPUTS: usize = 6;

/// Detection thresholds for [`ScrfdModel`].
#[derive(Debug, Clone)]
pub struct ScrfdConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for ScrfdConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// Scale and offsets applied when fitting the frame into the square input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Loaded SCRFD session, stored behind a [`ModelHandle`].
pub struct ScrfdSession {
    session: Arc<Mutex<Session>>,
}

/// SCRFD backend for [`crate::DetectorService`].
pub struct ScrfdModel {
    model_path: PathBuf,
    config: ScrfdConfig,
}

impl ScrfdModel {
    pub fn new(model_path: impl Into<PathBuf>, config: ScrfdConfig) -> Self {
        Self {
            model_path: model_path.into(),
            config,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// Run ONNX Runtime work on the blocking pool so the calling task stays cancellable.
async fn run_blocking<T, F>(
    on_join_error: fn(String) -> DetectorError,
    work: F,
) -> Result<T, DetectorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DetectorError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| on_join_error(format!("worker task failed: {e}")))?
}

/// Open and validate an SCRFD session. Blocking.
fn open_session(model_path: &Path) -> Result<Session, DetectorError> {
    if !model_path.exists() {
        return Err(DetectorError::ModelNotFound(
            model_path.display().to_string(),
        ));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    let outputs = session.outputs().len();
    tracing::info!(
        path = %model_path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs,
        "loaded SCRFD model"
    );

    if outputs < SCRFD_MIN_OUTPUTS {
        return Err(DetectorError::LoadFailed(format!(
            "SCRFD model needs at least {SCRFD_MIN_OUTPUTS} outputs (3 strides × score/bbox), got {outputs}"
        )));
    }

    Ok(session)
}

/// Run one forward pass and decode it into letterbox-mapped boxes. Blocking.
fn run_session(
    session: &mut Session,
    image: &PixelImage,
    config: &ScrfdConfig,
) -> Result<Vec<FaceBox>, DetectorError> {
    let (input, letterbox) = preprocess(image);
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let mut detections = Vec::new();
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        let (_, scores) = outputs[level]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
        let (_, bboxes) = outputs[level + SCRFD_STRIDES.len()]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

        detections.extend(decode_level(
            scores,
            bboxes,
            stride,
            &letterbox,
            config.confidence_threshold,
        ));
    }

    Ok(nms(detections, config.nms_threshold))
}

#[async_trait]
impl FaceDetectionModel for ScrfdModel {
    fn name(&self) -> &str {
        "scrfd"
    }

    async fn load(&self) -> Result<ModelHandle, DetectorError> {
        let model_path = self.model_path.clone();
        let session =
            run_blocking(DetectorError::LoadFailed, move || open_session(&model_path)).await?;
        Ok(ModelHandle::new(ScrfdSession {
            session: Arc::new(Mutex::new(session)),
        }))
    }

    async fn estimate(
        &self,
        image: &PixelImage,
        handle: &ModelHandle,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        let session = handle
            .downcast_ref::<ScrfdSession>()
            .ok_or(DetectorError::ForeignHandle)?
            .session
            .clone();
        let config = self.config.clone();
        let input = image.clone();

        let faces = run_blocking(DetectorError::InferenceFailed, move || {
            let mut session = session
                .lock()
                .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
            run_session(&mut session, &input, &config)
        })
        .await?;

        Ok(faces
            .into_iter()
            .filter_map(|face| clamp_to_image(face, image.width(), image.height()))
            .collect())
    }
}

/// Letterbox an RGBA image into a normalized NCHW RGB tensor.
fn preprocess(image: &PixelImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(
        image.width() as usize,
        image.height() as usize,
        SCRFD_INPUT_SIZE,
    );
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let resized = image.resize_bilinear(new_w, new_h);

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for y in 0..new_h as usize {
        for x in 0..new_w as usize {
            let px = resized.pixel(x as u32, y as u32);
            for c in 0..3 {
                tensor[[0, c, off_y + y, off_x + x]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Decode one stride level into source-space boxes above `threshold`.
fn decode_level(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<FaceBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (left, top) = letterbox.to_source(cx - offsets[0] * step, cy - offsets[1] * step);
            let (right, bottom) =
                letterbox.to_source(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(FaceBox::new(left, top, right, bottom, score))
        })
        .collect()
}

/// Clip a box to the image; drop it if nothing valid remains.
fn clamp_to_image(face: FaceBox, width: u32, height: u32) -> Option<FaceBox> {
    let (w, h) = (width as f32, height as f32);
    let clipped = FaceBox::new(
        face.left.clamp(0.0, w),
        face.top.clamp(0.0, h),
        face.right.clamp(0.0, w),
        face.bottom.clamp(0.0, h),
        face.confidence,
    );
    clipped.is_valid().then_some(clipped)
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let inter_w = (a.right.min(b.right) - a.left.max(b.left)).max(0.0);
    let inter_h = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceBox {
        FaceBox::new(x, y, x + w, y + h, conf)
    }

    #[test]
    fn test_iou_identical() {
        let a = face(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = face(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &face(20.0, 20.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let confidences: Vec<f32> = result.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_letterbox_maps_back_to_source() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));

        let (x, y) = lb.to_source(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let img = PixelImage::filled(320, 240, [255, 0, 128, 255]).unwrap();
        let (tensor, _) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        // Inside the letterboxed area.
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 320, 320]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        // Padding band above it.
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
    }

    #[test]
    fn test_decode_level_thresholds_and_maps() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];

        // Anchor in cell (col 2, row 1): centre (64, 32) in letterboxed space.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let faces = decode_level(&scores, &bboxes, stride, &lb, 0.5);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0], FaceBox::new(16.0, 0.0, 48.0, 32.0, 0.95));
    }

    #[test]
    fn test_clamp_to_image() {
        let clipped = clamp_to_image(FaceBox::new(-5.0, 10.0, 50.0, 120.0, 0.8), 40, 100).unwrap();
        assert_eq!(clipped, FaceBox::new(0.0, 10.0, 40.0, 100.0, 0.8));
        assert!(clamp_to_image(FaceBox::new(50.0, 0.0, 60.0, 10.0, 0.8), 40, 100).is_none());
    }

    #[tokio::test]
    async fn test_missing_model_file() {
        let model = ScrfdModel::new("/nonexistent/det_10g.onnx", ScrfdConfig::default());
        assert!(matches!(
            model.load().await,
            Err(DetectorError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_work_runs_off_the_runtime_thread() {
        let here = std::thread::current().id();
        let there = run_blocking(DetectorError::InferenceFailed, || Ok(std::thread::current().id()))
            .await
            .unwrap();
        assert_ne!(here, there);
    }

    #[tokio::test]
    async fn test_panicking_blocking_work_becomes_an_error() {
        let result: Result<(), _> =
            run_blocking(DetectorError::InferenceFailed, || panic!("onnx exploded")).await;
        assert!(matches!(result, Err(DetectorError::InferenceFailed(_))));
    }

    #[tokio::test]
    async fn test_foreign_handle_rejected() {
        let model = ScrfdModel::new("/nonexistent/det_10g.onnx", ScrfdConfig::default());
        let img = PixelImage::filled(8, 8, [0, 0, 0, 255]).unwrap();
        assert!(matches!(
            model.estimate(&img, &ModelHandle::new(7u32)).await,
            Err(DetectorError::ForeignHandle)
        ));
    }
}
