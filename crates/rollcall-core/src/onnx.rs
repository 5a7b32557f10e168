//! ONNX Runtime embedder: SCRFD detection + ArcFace embeddings.

use crate::detector::FaceDetector;
use crate::embedder::{DetectionMode, Embedder, EmbedderError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Embedding, FaceLocation};
use image::RgbImage;
use std::path::Path;

pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, EmbedderError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl Embedder for OnnxEmbedder {
    fn detect(&mut self, image: &RgbImage, mode: DetectionMode) -> Result<Vec<FaceLocation>, EmbedderError> {
        let detections = self.detector.detect(image, mode)?;
        Ok(detections.into_iter().map(|d| d.location).collect())
    }

    fn embed(&mut self, image: &RgbImage, locations: &[FaceLocation]) -> Result<Vec<Embedding>, EmbedderError> {
        let mut embeddings = Vec::with_capacity(locations.len());
        for location in locations {
            match self.recognizer.extract(image, location) {
                Ok(embedding) => embeddings.push(embedding),
                Err(RecognizerError::EmptyRegion) => {
                    // Later faces would lose their pairing with `locations`.
                    tracing::warn!(?location, "face region outside image; remaining faces not embedded");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(embeddings)
    }
}
