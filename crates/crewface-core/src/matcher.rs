//! Probe-vs-gallery matching under distance and confidence thresholds.

use crate::types::{cosine_distance, euclidean_l2_distance, FaceMatch, GalleryEntry, Probe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.40;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.70;
pub const DEFAULT_MAX_MATCHES: usize = 5;

/// Distance metric used to compare embeddings. Must match the metric the
/// extractor model was calibrated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_distance(a, b),
            Self::EuclideanL2 => euclidean_l2_distance(a, b),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::EuclideanL2 => f.write_str("euclidean_l2"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean_l2" | "l2" => Ok(Self::EuclideanL2),
            other => Err(format!(
                "unknown distance metric `{other}` (expected cosine or euclidean_l2)"
            )),
        }
    }
}

/// Thresholds applied by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    pub metric: DistanceMetric,
    /// Maximum distance (inclusive) for a candidate to pass.
    pub distance_threshold: f32,
    /// Minimum probe detector confidence (inclusive) for any candidate to pass.
    pub confidence_threshold: f32,
    pub max_matches: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_matches: DEFAULT_MAX_MATCHES,
        }
    }
}

/// Strategy for ranking a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Return at most `max_matches` passing candidates, best first.
    fn rank(&self, probe: &Probe, gallery: &[GalleryEntry], max_matches: usize) -> Vec<FaceMatch>;
}

/// Linear-scan matcher. Every gallery entry is compared; candidates are
/// ordered by ascending distance with ties broken by `subject_id`.
#[derive(Debug, Clone, Default)]
pub struct GalleryMatcher {
    config: MatchConfig,
}

impl GalleryMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Rank using the configured `max_matches`.
    pub fn rank_default(&self, probe: &Probe, gallery: &[GalleryEntry]) -> Vec<FaceMatch> {
        self.rank(probe, gallery, self.config.max_matches)
    }
}

impl Matcher for GalleryMatcher {
    fn rank(&self, probe: &Probe, gallery: &[GalleryEntry], max_matches: usize) -> Vec<FaceMatch> {
        if max_matches == 0 || !(probe.confidence >= self.config.confidence_threshold) {
            tracing::debug!(
                confidence = probe.confidence,
                threshold = self.config.confidence_threshold,
                max_matches,
                "probe rejected before gallery scan"
            );
            return Vec::new();
        }

        let mut matches: Vec<FaceMatch> = Vec::new();
        for entry in gallery {
            if entry.vector.len() != probe.vector.len() {
                tracing::warn!(
                    subject_id = %entry.subject_id,
                    gallery_dim = entry.vector.len(),
                    probe_dim = probe.vector.len(),
                    "skipping gallery entry with incompatible dimension"
                );
                continue;
            }

            let distance = self.config.metric.distance(&probe.vector, &entry.vector);
            if distance <= self.config.distance_threshold {
                matches.push(FaceMatch {
                    subject_id: entry.subject_id.clone(),
                    distance,
                    confidence: probe.confidence,
                });
            }
        }

        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        matches.truncate(max_matches);

        tracing::debug!(
            gallery = gallery.len(),
            matched = matches.len(),
            metric = %self.config.metric,
            "gallery scan complete"
        );
        matches
    }
}

/// True when the best match is not separated from the runner-up by at least
/// `margin` in score space.
pub fn is_ambiguous(matches: &[FaceMatch], margin: f32) -> bool {
    match matches {
        [best, second, ..] => best.score() - second.score() < margin,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> GalleryEntry {
        GalleryEntry { subject_id: id.into(), vector }
    }

    fn probe(vector: Vec<f32>, confidence: f32) -> Probe {
        Probe { vector, confidence }
    }

    fn unit_at_cos(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_scenario_best_match_only() {
        // distance(probe, A) = 0.1, distance(probe, B) = 0.6
        let gallery = vec![entry("A", unit_at_cos(0.9)), entry("B", unit_at_cos(0.4))];
        let matcher = GalleryMatcher::new(MatchConfig {
            distance_threshold: 0.4,
            ..MatchConfig::default()
        });

        let result = matcher.rank(&probe(vec![1.0, 0.0], 0.9), &gallery, 5);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].subject_id, "A");
        assert!((result[0].distance - 0.1).abs() < 1e-5, "distance = {}", result[0].distance);
        assert_eq!(result[0].confidence, 0.9);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // Orthogonal vectors: cosine distance is exactly 1.0.
        let gallery = vec![entry("A", vec![0.0, 1.0])];
        let p = probe(vec![1.0, 0.0], 0.9);

        let at = GalleryMatcher::new(MatchConfig {
            distance_threshold: 1.0,
            ..MatchConfig::default()
        });
        assert_eq!(at.rank(&p, &gallery, 5).len(), 1);

        let below = f32::from_bits(1.0f32.to_bits() - 1);
        let under = GalleryMatcher::new(MatchConfig {
            distance_threshold: below,
            ..MatchConfig::default()
        });
        assert!(under.rank(&p, &gallery, 5).is_empty());
    }

    #[test]
    fn test_threshold_boundary_computed_distance() {
        let gallery = vec![entry("A", vec![0.3, 0.7, 0.2])];
        let p = probe(vec![0.5, 0.1, 0.9], 0.8);
        let d = cosine_distance(&p.vector, &gallery[0].vector);

        let at = GalleryMatcher::new(MatchConfig {
            distance_threshold: d,
            ..MatchConfig::default()
        });
        assert_eq!(at.rank(&p, &gallery, 5).len(), 1);

        let just_below = f32::from_bits(d.to_bits() - 1);
        let under = GalleryMatcher::new(MatchConfig {
            distance_threshold: just_below,
            ..MatchConfig::default()
        });
        assert!(under.rank(&p, &gallery, 5).is_empty());
    }

    #[test]
    fn test_low_probe_confidence_yields_nothing() {
        let gallery = vec![entry("A", vec![1.0, 0.0])];
        let matcher = GalleryMatcher::default();
        assert!(matcher.rank(&probe(vec![1.0, 0.0], 0.69), &gallery, 5).is_empty());
        assert_eq!(matcher.rank(&probe(vec![1.0, 0.0], 0.70), &gallery, 5).len(), 1);
    }

    #[test]
    fn test_ordering_ties_and_limit() {
        let gallery = vec![
            entry("C", vec![1.0, 0.0]),
            entry("B", unit_at_cos(0.95)),
            entry("A", vec![2.0, 0.0]),
            entry("D", unit_at_cos(0.8)),
        ];
        let matcher = GalleryMatcher::new(MatchConfig {
            distance_threshold: 0.4,
            ..MatchConfig::default()
        });
        let p = probe(vec![1.0, 0.0], 0.9);

        let all: Vec<String> = matcher
            .rank(&p, &gallery, 10)
            .into_iter()
            .map(|m| m.subject_id)
            .collect();
        // A and C are both at distance 0, tie broken by subject_id.
        assert_eq!(all, vec!["A", "C", "B", "D"]);

        let top2: Vec<String> = matcher
            .rank(&p, &gallery, 2)
            .into_iter()
            .map(|m| m.subject_id)
            .collect();
        assert_eq!(top2, vec!["A", "C"]);
    }

    #[test]
    fn test_rank_is_idempotent() {
        let gallery = vec![
            entry("A", unit_at_cos(0.9)),
            entry("B", unit_at_cos(0.85)),
            entry("C", unit_at_cos(0.99)),
        ];
        let matcher = GalleryMatcher::default();
        let p = probe(vec![1.0, 0.0], 0.95);
        assert_eq!(matcher.rank(&p, &gallery, 5), matcher.rank(&p, &gallery, 5));
    }

    #[test]
    fn test_dimension_mismatch_skipped() {
        let gallery = vec![entry("A", vec![1.0, 0.0, 0.0]), entry("B", vec![1.0, 0.0])];
        let result = GalleryMatcher::default().rank(&probe(vec![1.0, 0.0], 0.9), &gallery, 5);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].subject_id, "B");
    }

    #[test]
    fn test_empty_gallery() {
        assert!(GalleryMatcher::default().rank(&probe(vec![1.0], 0.9), &[], 5).is_empty());
    }

    #[test]
    fn test_euclidean_metric() {
        let gallery = vec![entry("A", vec![3.0, 0.0]), entry("B", vec![0.0, 1.0])];
        let matcher = GalleryMatcher::new(MatchConfig {
            metric: DistanceMetric::EuclideanL2,
            distance_threshold: 1.0,
            ..MatchConfig::default()
        });
        let result = matcher.rank(&probe(vec![1.0, 0.0], 0.9), &gallery, 5);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].subject_id, "A");
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<DistanceMetric>(), Ok(DistanceMetric::Cosine));
        assert_eq!("Euclidean_L2".parse::<DistanceMetric>(), Ok(DistanceMetric::EuclideanL2));
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_is_ambiguous() {
        let close = vec![
            FaceMatch { subject_id: "A".into(), distance: 0.10, confidence: 0.9 },
            FaceMatch { subject_id: "B".into(), distance: 0.20, confidence: 0.9 },
        ];
        assert!(is_ambiguous(&close, 0.10));

        let clear = vec![
            FaceMatch { subject_id: "A".into(), distance: 0.05, confidence: 0.9 },
            FaceMatch { subject_id: "B".into(), distance: 0.40, confidence: 0.9 },
        ];
        assert!(!is_ambiguous(&clear, 0.10));
        assert!(!is_ambiguous(&clear[..1], 0.10));
    }
}
