//! Nearest-neighbour identity matching over the enrollment cache.

use crate::types::{Embedding, FailureReason, Identity};

/// Result of matching a probe embedding against the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        name: String,
        distance: f32,
        /// Insertion index of the winning cache entry.
        index: usize,
    },
    Unmatched {
        reason: FailureReason,
        /// Distance to the nearest comparable entry, if there was one.
        nearest: Option<f32>,
    },
}

impl MatchResult {
    pub fn name(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { name, .. } => Some(name),
            MatchResult::Unmatched { .. } => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// Strategy for comparing a probe embedding against the enrolled identities.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], tolerance: f32) -> MatchResult;
}

/// Euclidean-distance matcher.
///
/// Accepts the closest entry when its distance is `<= tolerance`. Equal
/// distances resolve to the earliest entry, so the result only depends on
/// cache order. Entries whose dimension differs from the probe are skipped.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], tolerance: f32) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::Unmatched {
                reason: FailureReason::EmptyCache,
                nearest: None,
            };
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in gallery.iter().enumerate() {
            if identity.embedding.dim() != probe.dim() {
                tracing::debug!(
                    index = i,
                    expected = probe.dim(),
                    actual = identity.embedding.dim(),
                    "skipping cache entry with mismatched dimension"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&identity.embedding);
            // Strict `<`: the first of several equal minima wins. NaN never wins.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((index, distance)) if distance <= tolerance => MatchResult::Matched {
                name: gallery[index].name.clone(),
                distance,
                index,
            },
            _ => MatchResult::Unmatched {
                reason: FailureReason::NoConfidentMatch,
                nearest: best.map(|(_, d)| d),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, values: &[f32]) -> Identity {
        Identity {
            name: name.into(),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    #[test]
    fn test_nearest_entry_wins() {
        let gallery = vec![identity("A", &[0.0, 0.0]), identity("B", &[1.2, 0.0])];
        let probe = Embedding::new(vec![0.3, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        match result {
            MatchResult::Matched { name, distance, index } => {
                assert_eq!(name, "A");
                assert_eq!(index, 0);
                assert!((distance - 0.3).abs() < 1e-6);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_distance_equal_to_tolerance_is_accepted() {
        let gallery = vec![identity("solo", &[0.0, 0.0])];
        let probe = Embedding::new(vec![0.55, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert_eq!(result.name(), Some("solo"));
    }

    #[test]
    fn test_distance_just_over_tolerance_is_rejected() {
        let gallery = vec![identity("solo", &[0.0, 0.0])];
        let probe = Embedding::new(vec![0.5501, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert!(matches!(
            result,
            MatchResult::Unmatched { reason: FailureReason::NoConfidentMatch, nearest: Some(_) }
        ));
    }

    #[test]
    fn test_tie_resolves_to_lowest_index() {
        // "zed" sorts after "amy" but was enrolled first.
        let gallery = vec![identity("zed", &[0.2, 0.0]), identity("amy", &[-0.2, 0.0])];
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert_eq!(result.name(), Some("zed"));

        let swapped = vec![gallery[1].clone(), gallery[0].clone()];
        let result = EuclideanMatcher.compare(&probe, &swapped, 0.55);
        assert_eq!(result.name(), Some("amy"));
    }

    #[test]
    fn test_empty_cache_never_matches() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        for tolerance in [0.0, 0.55, 10.0, f32::MAX] {
            let result = EuclideanMatcher.compare(&probe, &[], tolerance);
            assert_eq!(
                result,
                MatchResult::Unmatched { reason: FailureReason::EmptyCache, nearest: None }
            );
        }
    }

    #[test]
    fn test_duplicate_names_are_independent_entries() {
        let gallery = vec![
            identity("alice", &[1.0, 0.0]),
            identity("bob", &[0.0, 1.0]),
            identity("alice", &[0.0, -1.0]),
        ];
        let probe = Embedding::new(vec![0.0, -0.9]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert!(matches!(result, MatchResult::Matched { index: 2, .. }));
        assert_eq!(result.name(), Some("alice"));
    }

    #[test]
    fn test_mismatched_dimension_is_skipped() {
        let gallery = vec![identity("short", &[0.0]), identity("full", &[0.1, 0.0])];
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert_eq!(result.name(), Some("full"));
    }

    #[test]
    fn test_no_comparable_entry_is_no_confident_match() {
        let gallery = vec![identity("short", &[0.0])];
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert_eq!(
            result,
            MatchResult::Unmatched { reason: FailureReason::NoConfidentMatch, nearest: None }
        );
    }

    #[test]
    fn test_nan_probe_never_matches() {
        let gallery = vec![identity("a", &[0.0, 0.0])];
        let probe = Embedding::new(vec![f32::NAN, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &gallery, 0.55);
        assert!(!result.is_match());
    }
}
