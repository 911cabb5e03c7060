//! crewface-core — face embedding extraction and gallery matching.
//!
//! Uses SCRFD for face detection and profile-driven recognition models
//! (Facenet512, ArcFace) via ONNX Runtime, plus the probe-vs-gallery matcher
//! shared by enrollment and attendance recognition.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod retry;
pub mod types;

pub use extractor::{
    ExtractedFace, ExtractionError, ExtractionErrorKind, FaceExtractor, OnnxExtractor,
    OnnxExtractorConfig,
};
pub use matcher::{DistanceMetric, GalleryMatcher, MatchConfig, Matcher};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use types::{BoundingBox, Embedding, FaceMatch, GalleryEntry, NormalizedImage, Probe};
