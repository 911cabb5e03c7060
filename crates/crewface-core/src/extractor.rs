//! Embedding extractor capability: normalized image in, one face embedding out.
//!
//! [`FaceExtractor`] is the seam the pipeline depends on. [`OnnxExtractor`] is
//! the bundled implementation (SCRFD detection + profile-driven recognition).

use crate::detector::FaceDetector;
use crate::recognizer::{FaceRecognizer, RecognizerProfile};
use crate::types::{BoundingBox, Embedding, NormalizedImage};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Closed set of extraction failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected, best confidence {best_confidence:.2} below threshold")]
    MultipleFaces { count: usize, best_confidence: f32 },
    #[error("extractor backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionErrorKind {
    NoFaceDetected,
    MultipleFaces,
    BackendError,
}

impl fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoFaceDetected => "NoFaceDetected",
            Self::MultipleFaces => "MultipleFaces",
            Self::BackendError => "BackendError",
        })
    }
}

impl ExtractionError {
    pub fn kind(&self) -> ExtractionErrorKind {
        match self {
            Self::NoFaceDetected => ExtractionErrorKind::NoFaceDetected,
            Self::MultipleFaces { .. } => ExtractionErrorKind::MultipleFaces,
            Self::Backend(_) => ExtractionErrorKind::BackendError,
        }
    }

    /// Only infrastructure failures are worth retrying; an absent or blurry
    /// face will not change on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// The face an embedding was extracted from.
#[derive(Debug, Clone)]
pub struct ExtractedFace {
    pub embedding: Embedding,
    /// Detector confidence of the selected face, in [0, 1].
    pub confidence: f32,
    pub face: BoundingBox,
    pub faces_detected: usize,
}

/// Image → embedding capability. Implementations are stateless from the
/// caller's point of view and safe to share across threads.
pub trait FaceExtractor: Send + Sync {
    fn extract(
        &self,
        image: &NormalizedImage,
        model_name: &str,
        detector_backend: &str,
    ) -> Result<ExtractedFace, ExtractionError>;
}

/// Pick the face to embed from detector output.
///
/// The highest-confidence face wins; exact confidence ties go to the larger
/// box. If the winner is below `min_confidence` the result is
/// `MultipleFaces` when several faces were seen, otherwise `NoFaceDetected`.
pub fn select_face(
    faces: &[BoundingBox],
    min_confidence: f32,
) -> Result<&BoundingBox, ExtractionError> {
    let best = faces
        .iter()
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| a.area().total_cmp(&b.area()))
        })
        .ok_or(ExtractionError::NoFaceDetected)?;

    if best.confidence >= min_confidence {
        return Ok(best);
    }
    if faces.len() > 1 {
        Err(ExtractionError::MultipleFaces {
            count: faces.len(),
            best_confidence: best.confidence,
        })
    } else {
        Err(ExtractionError::NoFaceDetected)
    }
}

/// Face detector networks the ONNX extractor can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorBackend {
    Scrfd,
}

/// Detector names from older deployments that the bundled SCRFD model serves.
const SCRFD_ALIASES: &[&str] = &["mtcnn", "retinaface"];

impl DetectorBackend {
    /// Resolve a configured detector name. Legacy names in
    /// [`SCRFD_ALIASES`] resolve to SCRFD.
    pub fn by_name(name: &str) -> Result<Self, ExtractionError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Ok(Self::Scrfd),
            alias if SCRFD_ALIASES.contains(&alias) => Ok(Self::Scrfd),
            other => Err(ExtractionError::Backend(format!(
                "detector backend `{other}` has no ONNX decoder (supported: scrfd, {})",
                SCRFD_ALIASES.join(", ")
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scrfd => "scrfd",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Scrfd => "det_10g.onnx",
        }
    }
}

/// Settings for [`OnnxExtractor::load`].
#[derive(Debug, Clone)]
pub struct OnnxExtractorConfig {
    pub model_dir: PathBuf,
    pub model_name: String,
    pub detector_backend: String,
    /// Minimum detector confidence for the selected face.
    pub min_face_confidence: f32,
}

struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// ONNX Runtime extractor. Sessions need `&mut` to run, so they sit behind
/// a mutex; callers drive it from blocking threads.
pub struct OnnxExtractor {
    models: Mutex<Models>,
    backend: DetectorBackend,
    profile: RecognizerProfile,
    min_face_confidence: f32,
}

impl OnnxExtractor {
    /// Load detector and recognizer models from `config.model_dir`.
    pub fn load(config: &OnnxExtractorConfig) -> Result<Self, ExtractionError> {
        let backend = DetectorBackend::by_name(&config.detector_backend)?;
        if !config.detector_backend.trim().eq_ignore_ascii_case(backend.name()) {
            tracing::warn!(
                requested = %config.detector_backend,
                using = backend.name(),
                "detector backend has no dedicated model, using the bundled detector"
            );
        }
        let profile = RecognizerProfile::by_name(&config.model_name).map_err(backend_error)?;

        let detector = FaceDetector::load(&config.model_dir.join(backend.file_name()))
            .map_err(backend_error)?;
        let recognizer = FaceRecognizer::load(&config.model_dir, profile).map_err(backend_error)?;

        tracing::info!(
            model_dir = %config.model_dir.display(),
            detector = backend.name(),
            model = profile.model_name,
            "ONNX extractor ready"
        );

        Ok(Self {
            models: Mutex::new(Models { detector, recognizer }),
            backend,
            profile,
            min_face_confidence: config.min_face_confidence,
        })
    }

    pub fn model_dir_hint(
        model_dir: &Path,
        model_name: &str,
        detector_backend: &str,
    ) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(b) = DetectorBackend::by_name(detector_backend) {
            files.push(model_dir.join(b.file_name()));
        }
        if let Ok(p) = RecognizerProfile::by_name(model_name) {
            files.push(model_dir.join(p.file_name));
        }
        files
    }
}

fn backend_error(err: impl fmt::Display) -> ExtractionError {
    ExtractionError::Backend(err.to_string())
}

impl FaceExtractor for OnnxExtractor {
    fn extract(
        &self,
        image: &NormalizedImage,
        model_name: &str,
        detector_backend: &str,
    ) -> Result<ExtractedFace, ExtractionError> {
        if !self.profile.model_name.eq_ignore_ascii_case(model_name) {
            return Err(ExtractionError::Backend(format!(
                "model `{model_name}` not loaded (loaded: {})",
                self.profile.model_name
            )));
        }
        if DetectorBackend::by_name(detector_backend)? != self.backend {
            return Err(ExtractionError::Backend(format!(
                "detector `{detector_backend}` not loaded (loaded: {})",
                self.backend.name()
            )));
        }

        let mut models = self
            .models
            .lock()
            .map_err(|_| ExtractionError::Backend("extractor state poisoned".into()))?;

        let faces = models.detector.detect(&image.pixels).map_err(backend_error)?;
        let face = select_face(&faces, self.min_face_confidence)?.clone();

        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            width = face.width,
            height = face.height,
            "face selected"
        );

        let embedding = models.recognizer.extract(&image.pixels, &face).map_err(backend_error)?;

        Ok(ExtractedFace {
            embedding,
            confidence: face.confidence.clamp(0.0, 1.0),
            faces_detected: faces.len(),
            face,
        })
    }
}
