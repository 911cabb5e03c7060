//! Enrollment and recognition entry points for the API layer.

use crate::orchestrator::{
    extract_with_retry, preprocess_blocking, BatchOrchestrator, StageError, SubjectOutcome,
};
use crate::roster::{RosterError, RosterSource, Subject};
use crate::store::{EmbeddingRecord, EmbeddingStore, StoreError};
use crewface_core::matcher::is_ambiguous;
use crewface_core::{ExtractionError, FaceMatch, GalleryMatcher, MatchConfig, Matcher, Probe};
use crewface_image::{validate_image, InvalidImage};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrollAction {
    Enrolled,
    Reenrolled { previous_id: i64 },
    /// An active embedding existed and `force` was not set.
    AlreadyEnrolled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollResult {
    pub subject: Subject,
    pub record: EmbeddingRecord,
    pub action: EnrollAction,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("subject {0} not found in roster (or inactive, or has no photo)")]
    SubjectNotFound(String),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("enrollment failed: {0}")]
    Failed(#[from] StageError),
}

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("invalid probe image: {0}")]
    InvalidImage(#[from] InvalidImage),
    #[error("probe preprocessing failed: {0}")]
    Preprocess(#[source] StageError),
    #[error("probe extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("gallery unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Single-subject enrollment and probe recognition over one store.
pub struct EnrollmentService<R> {
    orchestrator: BatchOrchestrator<R>,
    matcher: GalleryMatcher,
    ambiguity_margin: f32,
    max_image_bytes: usize,
}

impl<R: RosterSource> EnrollmentService<R> {
    pub fn new(
        orchestrator: BatchOrchestrator<R>,
        matching: MatchConfig,
        ambiguity_margin: f32,
        max_image_bytes: usize,
    ) -> Self {
        Self {
            orchestrator,
            matcher: GalleryMatcher::new(matching),
            ambiguity_margin,
            max_image_bytes,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        self.orchestrator.store()
    }

    /// Enroll one roster subject from their remote photo.
    pub async fn enroll(&self, subject_id: &str, force: bool) -> Result<EnrollResult, EnrollError> {
        let subject = self
            .orchestrator
            .roster()
            .subject(subject_id)
            .await?
            .ok_or_else(|| EnrollError::SubjectNotFound(subject_id.to_string()))?;

        tracing::info!(subject_id, force, "enroll requested");
        let report = self.orchestrator.process_subject(&subject, force).await;

        let (record, action) = match report.outcome {
            SubjectOutcome::Succeeded {
                record,
                replaced: None,
            } => (record, EnrollAction::Enrolled),
            SubjectOutcome::Succeeded {
                record,
                replaced: Some(previous_id),
            } => (record, EnrollAction::Reenrolled { previous_id }),
            SubjectOutcome::Skipped { record } => (record, EnrollAction::AlreadyEnrolled),
            SubjectOutcome::Failed(err) => return Err(err.into()),
        };
        Ok(EnrollResult { subject, record, action })
    }

    /// Match a probe photo against the active gallery.
    pub async fn recognize(&self, probe_image: &[u8]) -> Result<Vec<FaceMatch>, RecognizeError> {
        let info = validate_image(probe_image, self.max_image_bytes)?;
        tracing::debug!(width = info.width, height = info.height, "recognize requested");

        let settings = self.orchestrator.settings();
        let image = preprocess_blocking(probe_image.to_vec(), settings.preprocess)
            .await
            .map_err(RecognizeError::Preprocess)?;
        let face = extract_with_retry(self.orchestrator.extractor(), image, settings).await?;

        let probe = Probe {
            vector: face.embedding.values,
            confidence: face.confidence,
        };
        Ok(self.recognize_embedding_default(&probe).await?)
    }

    /// Match an already-extracted probe against the active gallery of the
    /// configured model, returning up to `MAX_FACE_MATCHES` results.
    pub async fn recognize_embedding_default(
        &self,
        probe: &Probe,
    ) -> Result<Vec<FaceMatch>, StoreError> {
        let model = &self.orchestrator.settings().model_name;
        self.recognize_embedding(probe, model, self.matcher.config().max_matches)
            .await
    }

    /// Match a probe vector against the active embeddings produced by
    /// `model_name`. Records from other models are never compared.
    pub async fn recognize_embedding(
        &self,
        probe: &Probe,
        model_name: &str,
        max_matches: usize,
    ) -> Result<Vec<FaceMatch>, StoreError> {
        let gallery = self.store().get_active_gallery(model_name).await?;
        let matches = self.matcher.rank(probe, &gallery, max_matches);
        tracing::info!(
            model = model_name,
            gallery = gallery.len(),
            matches = matches.len(),
            best = matches.first().map(|m| m.subject_id.as_str()),
            "recognition complete"
        );
        Ok(matches)
    }

    /// True when the top two matches are too close to call.
    pub fn is_ambiguous(&self, matches: &[FaceMatch]) -> bool {
        is_ambiguous(matches, self.ambiguity_margin)
    }
}
