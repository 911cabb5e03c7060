//! Face embedding extraction via ONNX Runtime.
//!
//! Each supported model is described by a [`RecognizerProfile`]: input size,
//! tensor layout, pixel normalization and embedding dimension.

use crate::alignment;
use crate::types::{l2_normalize, BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported recognition model `{0}` (supported: Facenet512, ArcFace)")]
    UnsupportedModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// 1×3×H×W
    Nchw,
    /// 1×H×W×3
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelNormalization {
    /// `(x - mean) / std` per channel value.
    Fixed { mean: f32, std: f32 },
    /// Standardize by the crop's own mean and standard deviation.
    PerImage,
}

/// Static description of a recognition model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizerProfile {
    pub model_name: &'static str,
    pub file_name: &'static str,
    pub input_size: u32,
    pub layout: TensorLayout,
    pub normalization: PixelNormalization,
    pub embedding_dim: usize,
}

pub const FACENET512: RecognizerProfile = RecognizerProfile {
    model_name: "Facenet512",
    file_name: "facenet512.onnx",
    input_size: 160,
    layout: TensorLayout::Nhwc,
    normalization: PixelNormalization::PerImage,
    embedding_dim: 512,
};

pub const ARCFACE: RecognizerProfile = RecognizerProfile {
    model_name: "ArcFace",
    file_name: "w600k_r50.onnx",
    input_size: 112,
    layout: TensorLayout::Nchw,
    // Symmetric normalization: std is 127.5, not 128.
    normalization: PixelNormalization::Fixed { mean: 127.5, std: 127.5 },
    embedding_dim: 512,
};

impl RecognizerProfile {
    /// Look up a profile by model name (case-insensitive).
    pub fn by_name(model_name: &str) -> Result<Self, RecognizerError> {
        [FACENET512, ARCFACE]
            .into_iter()
            .find(|p| p.model_name.eq_ignore_ascii_case(model_name))
            .ok_or_else(|| RecognizerError::UnsupportedModel(model_name.to_string()))
    }

    /// Convert an aligned `input_size`² crop into the model's input tensor.
    pub fn tensor(&self, aligned: &RgbImage) -> Array4<f32> {
        let size = self.input_size as usize;
        let (mean, std) = match self.normalization {
            PixelNormalization::Fixed { mean, std } => (mean, std),
            PixelNormalization::PerImage => per_image_stats(aligned),
        };

        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
        };

        for (x, y, pixel) in aligned.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                let v = (pixel[c] as f32 - mean) / std;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                }
            }
        }
        tensor
    }
}

/// Mean and standard deviation across all channel values, with the std
/// floored at `1/sqrt(n)` so flat crops do not divide by zero.
fn per_image_stats(img: &RgbImage) -> (f32, f32) {
    let raw = img.as_raw();
    if raw.is_empty() {
        return (0.0, 1.0);
    }
    // Sums over a full crop overflow f32 precision.
    let n = raw.len() as f64;
    let mean = raw.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = raw.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
    (mean as f32, var.sqrt().max(1.0 / n.sqrt()) as f32)
}

/// ONNX-backed face recognizer for one profile.
pub struct FaceRecognizer {
    session: Session,
    profile: RecognizerProfile,
}

impl FaceRecognizer {
    /// Load the model file for `profile` from `model_dir`.
    pub fn load(model_dir: &Path, profile: RecognizerProfile) -> Result<Self, RecognizerError> {
        let model_path = model_dir.join(profile.file_name);
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = profile.model_name,
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self { session, profile })
    }

    pub fn profile(&self) -> &RecognizerProfile {
        &self.profile
    }

    /// Align `face` and extract an L2-normalized embedding.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks, self.profile.input_size);
        let input = self.profile.tensor(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let mut values = raw.to_vec();
        if values.len() != self.profile.embedding_dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.profile.embedding_dim,
                values.len()
            )));
        }
        l2_normalize(&mut values);

        Ok(Embedding::new(values, self.profile.model_name))
    }
}
