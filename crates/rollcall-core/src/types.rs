use serde::{Deserialize, Serialize};

/// Face location in pixel offsets, ordered `(top, right, bottom, left)`.
///
/// Offsets are signed: detectors may report boxes that extend past the
/// image border. Use [`clamp_to`](Self::clamp_to) before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceLocation {
    pub fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    /// Grow the box by `ratio` of its size on every side.
    pub fn expand(&self, ratio: f32) -> Self {
        let dx = (self.width() as f32 * ratio).round() as i32;
        let dy = (self.height() as f32 * ratio).round() as i32;
        Self {
            top: self.top - dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
            left: self.left - dx,
        }
    }

    /// Intersect the box with a `width × height` image.
    ///
    /// Returns `(x, y, w, h)` of the visible region, or `None` when nothing
    /// of the box lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let max_x = i64::from(width);
        let max_y = i64::from(height);
        let left = i64::from(self.left).clamp(0, max_x);
        let right = i64::from(self.right).clamp(0, max_x);
        let top = i64::from(self.top).clamp(0, max_y);
        let bottom = i64::from(self.bottom).clamp(0, max_y);

        if right <= left || bottom <= top {
            return None;
        }
        Some((
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must check [`dim`](Self::dim) first: mismatched lengths are
    /// compared over the shorter prefix only.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled reference face: display name plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub embedding: Embedding,
}

/// Why a detected face was routed to the failure archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The nearest reference embedding was farther than the tolerance.
    NoConfidentMatch,
    /// There were no reference embeddings to compare against.
    EmptyCache,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoConfidentMatch => "NoConfidentMatch",
            FailureReason::EmptyCache => "EmptyCache",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.25, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_345() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_location_size() {
        let loc = FaceLocation::new(10, 50, 40, 20);
        assert_eq!(loc.width(), 30);
        assert_eq!(loc.height(), 30);

        let inverted = FaceLocation::new(40, 20, 10, 50);
        assert_eq!(inverted.width(), 0);
        assert_eq!(inverted.height(), 0);
    }

    #[test]
    fn test_clamp_inside() {
        let loc = FaceLocation::new(10, 50, 40, 20);
        assert_eq!(loc.clamp_to(100, 100), Some((20, 10, 30, 30)));
    }

    #[test]
    fn test_clamp_partially_outside() {
        let loc = FaceLocation::new(-5, 120, 30, 90);
        assert_eq!(loc.clamp_to(100, 100), Some((90, 0, 10, 30)));
    }

    #[test]
    fn test_clamp_fully_outside() {
        let loc = FaceLocation::new(200, 260, 240, 220);
        assert_eq!(loc.clamp_to(100, 100), None);
    }

    #[test]
    fn test_expand() {
        let loc = FaceLocation::new(100, 200, 200, 100);
        let grown = loc.expand(0.1);
        assert_eq!(grown, FaceLocation::new(90, 210, 210, 90));
    }

    #[test]
    fn test_failure_reason_labels() {
        assert_eq!(FailureReason::NoConfidentMatch.to_string(), "NoConfidentMatch");
        assert_eq!(FailureReason::EmptyCache.to_string(), "EmptyCache");
    }
}
