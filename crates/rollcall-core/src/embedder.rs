//! Face detection + embedding capability.
//!
//! The matching pipeline only needs boxes and vectors; how they are produced
//! is up to the implementation. [`crate::onnx::OnnxEmbedder`] is the bundled
//! one.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::{Embedding, FaceLocation};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speed/accuracy trade-off requested from the detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Lower input resolution, favours throughput.
    #[default]
    Fast,
    /// Full input resolution, finds smaller faces.
    Accurate,
}

impl std::fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMode::Fast => write!(f, "fast"),
            DetectionMode::Accurate => write!(f, "accurate"),
        }
    }
}

impl std::str::FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectionMode::Fast),
            "accurate" | "cnn" => Ok(DetectionMode::Accurate),
            other => Err(format!("unknown detection mode: {other}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// Detects faces and turns them into fixed-dimension embeddings.
///
/// `embed` returns one embedding per requested location, in the same order.
/// A shorter vector means the trailing regions could not be embedded.
pub trait Embedder {
    fn detect(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<FaceLocation>, EmbedderError>;

    fn embed(
        &mut self,
        image: &RgbImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<Embedding>, EmbedderError>;

    fn detect_and_embed(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<(Vec<FaceLocation>, Vec<Embedding>), EmbedderError> {
        let locations = self.detect(image, mode)?;
        if locations.is_empty() {
            return Ok((locations, Vec::new()));
        }
        let embeddings = self.embed(image, &locations)?;
        Ok((locations, embeddings))
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn detect(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<FaceLocation>, EmbedderError> {
        (**self).detect(image, mode)
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<Embedding>, EmbedderError> {
        (**self).embed(image, locations)
    }
}
