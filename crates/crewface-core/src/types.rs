use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector produced by a named extractor model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor model that produced this embedding (e.g. "Facenet512").
    pub model_name: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_name: impl Into<String>) -> Self {
        Self {
            values,
            model_name: model_name.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and every component is finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }
}

/// Cosine similarity in [-1, 1]. Zero-norm inputs yield 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Cosine distance `1 - cos`, in [0, 2]. 0 means identical direction.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Euclidean distance between the L2-normalized forms of `a` and `b`, in [0, 2].
pub fn euclidean_l2_distance(a: &[f32], b: &[f32]) -> f32 {
    let na = l2_norm(a);
    let nb = l2_norm(b);
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let x = if na > 0.0 { x / na } else { *x };
            let y = if nb > 0.0 { y / nb } else { *y };
            (x - y).powi(2)
        })
        .sum::<f32>()
        .sqrt()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// RGB image after orientation correction, resizing and contrast normalization,
/// ready for face detection.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub pixels: RgbImage,
    /// Dimensions of the decoded source before any resize.
    pub source_width: u32,
    pub source_height: u32,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// One active embedding available for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub subject_id: String,
    pub vector: Vec<f32>,
}

/// A freshly extracted embedding to be matched against the gallery.
#[derive(Debug, Clone)]
pub struct Probe {
    pub vector: Vec<f32>,
    /// Detector confidence of the face the probe was extracted from.
    pub confidence: f32,
}

/// A gallery candidate that passed the matching thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub subject_id: String,
    pub distance: f32,
    /// Detector confidence of the probe face.
    pub confidence: f32,
}

impl FaceMatch {
    /// Distance folded into a [0, 1] score, higher is closer.
    pub fn score(&self) -> f32 {
        (1.0 - self.distance / 2.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_distance_orthogonal_is_exactly_one() {
        assert_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 1.0]), 1.0);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let d = euclidean_l2_distance(&[2.0, 0.0], &[5.0, 0.0]);
        assert!(d.abs() < 1e-6);
        let d = euclidean_l2_distance(&[1.0, 0.0], &[-3.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_embedding_well_formed() {
        assert!(Embedding::new(vec![0.1, 0.2], "m").is_well_formed());
        assert!(!Embedding::new(vec![], "m").is_well_formed());
        assert!(!Embedding::new(vec![0.1, f32::NAN], "m").is_well_formed());
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox {
            x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0, landmarks: None,
        };
        let b = BoundingBox { x: 20.0, y: 20.0, ..a.clone() };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_face_match_score() {
        let m = FaceMatch { subject_id: "A".into(), distance: 0.2, confidence: 0.9 };
        assert!((m.score() - 0.9).abs() < 1e-6);
    }
}
