//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free 3-stride decoding with NMS post-processing. The input side
//! follows the requested [`DetectionMode`]: 320 px for `Fast`, 640 px for
//! `Accurate`. Frames are letterboxed into the square input.

use crate::embedder::DetectionMode;
use crate::types::FaceLocation;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_FAST_SIZE: usize = 320;
const SCRFD_ACCURATE_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("SCRFD model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A detected face with its detector score.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub location: FaceLocation,
    pub confidence: f32,
}

/// Corner-form box in original frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl RawBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &RawBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }

    fn into_detection(self) -> Detection {
        Detection {
            location: FaceLocation::new(
                self.y1.round() as i32,
                self.x2.round() as i32,
                self.y2.round() as i32,
                self.x1.round() as i32,
            ),
            confidence: self.score,
        }
    }
}

/// Scale and padding applied when letterboxing a frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox) output tensor indices for one stride.
type StrideOutputIndices = (usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            stride_indices: output_indices(&output_names),
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage, mode: DetectionMode) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let side = input_side(mode);
        let (input, letterbox) = preprocess(image, side);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, stride, side, &letterbox));
        }

        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), %mode, "SCRFD detection");
        Ok(kept.into_iter().map(RawBox::into_detection).collect())
    }
}

fn input_side(mode: DetectionMode) -> usize {
    match mode {
        DetectionMode::Fast => SCRFD_FAST_SIZE,
        DetectionMode::Accurate => SCRFD_ACCURATE_SIZE,
    }
}

/// Map stride slots to output tensors by name (`score_8`, `bbox_8`, ...),
/// falling back to the standard positional export order.
fn output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognised; using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Letterbox an RGB frame into a `side × side` NCHW tensor.
fn preprocess(image: &RgbImage, side: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, side as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, side as u32);
    let pad_x = (side as u32 - new_w) / 2;
    let pad_y = (side as u32 - new_h) / 2;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding stays 0.0, which is SCRFD_MEAN after normalisation.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, letterbox)
}

fn decode_stride(scores: &[f32], bboxes: &[f32], stride: usize, side: usize, letterbox: &Letterbox) -> Vec<RawBox> {
    let grid = side / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
            let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;
            Some(RawBox {
                x1: unmap_x(cx - offsets[0] * s),
                y1: unmap_y(cy - offsets[1] * s),
                x2: unmap_x(cx + offsets[2] * s),
                y2: unmap_y(cy + offsets[3] * s),
                score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending score.
fn nms(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<RawBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
