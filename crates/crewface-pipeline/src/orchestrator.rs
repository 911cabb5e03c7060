//! Batch enrollment: roster → fetch → preprocess → extract → store.
//!
//! Each subject walks the stages in order and the first failing stage ends
//! that subject only. Failures are counted, never propagated to the batch.

use crate::roster::{RosterError, RosterSource, Subject};
use crate::store::{
    EmbeddingRecord, EmbeddingStore, NewEmbedding, StoreError, StoreErrorKind, UpsertAction,
};
use crewface_core::{
    retry_with_backoff, ExtractedFace, ExtractionError, ExtractionErrorKind, FaceExtractor,
    NormalizedImage, RetryPolicy,
};
use crewface_image::{preprocess, FetchErrorKind, ImageFetcher, PreprocessConfig};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Where a subject is in the pipeline. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Pending,
    Fetching,
    Preprocessing,
    Extracting,
    Storing,
    Succeeded,
    Skipped,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Preprocessing => "preprocessing",
            Self::Extracting => "extracting",
            Self::Storing => "storing",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// Classified cause of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Fetch(FetchErrorKind),
    Decode,
    Extraction(ExtractionErrorKind),
    Store(StoreErrorKind),
    /// A blocking worker panicked or was cancelled.
    Task,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(kind) => write!(f, "{kind}"),
            Self::Decode => f.write_str("DecodeError"),
            Self::Extraction(kind) => write!(f, "{kind}"),
            Self::Store(kind) => write!(f, "{kind}"),
            Self::Task => f.write_str("TaskFailed"),
        }
    }
}

/// The stage a subject failed in, with the classified cause.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} failed ({kind}): {message}")]
pub struct StageError {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, kind: FailureKind, err: impl fmt::Display) -> Self {
        Self {
            stage,
            kind,
            message: err.to_string(),
        }
    }

    fn store(stage: Stage, err: StoreError) -> Self {
        Self::new(stage, FailureKind::Store(err.kind()), err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectOutcome {
    Succeeded {
        record: EmbeddingRecord,
        /// Id of the record this one replaced on forced re-enrollment.
        replaced: Option<i64>,
    },
    /// The subject already had an active embedding.
    Skipped { record: EmbeddingRecord },
    Failed(StageError),
}

impl SubjectOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Succeeded { .. } => Stage::Succeeded,
            Self::Skipped { .. } => Stage::Skipped,
            Self::Failed(_) => Stage::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubjectReport {
    pub subject: Subject,
    pub outcome: SubjectOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Subjects never scheduled because the run was cancelled.
    pub not_attempted: usize,
    pub elapsed: Duration,
    #[serde(skip)]
    pub reports: Vec<SubjectReport>,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            not_attempted: 0,
            elapsed: Duration::ZERO,
            reports: Vec::new(),
        }
    }

    fn record(&mut self, report: SubjectReport) {
        match report.outcome {
            SubjectOutcome::Succeeded { .. } => self.succeeded += 1,
            SubjectOutcome::Skipped { .. } => self.skipped += 1,
            SubjectOutcome::Failed(_) => self.failed += 1,
        }
        self.reports.push(report);
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.not_attempted
    }

    /// Mean wall time of the subjects that were processed.
    pub fn average_latency(&self) -> Duration {
        if self.reports.is_empty() {
            return Duration::ZERO;
        }
        self.reports.iter().map(|r| r.elapsed).sum::<Duration>() / self.reports.len() as u32
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Subject, &StageError)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            SubjectOutcome::Failed(err) => Some((&r.subject, err)),
            _ => None,
        })
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("subject {0} not found in roster (or inactive, or has no photo)")]
    SubjectNotFound(String),
    #[error(transparent)]
    Roster(#[from] RosterError),
}

/// Which subjects a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    All,
    Subject(String),
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Re-enroll subjects that already have an active embedding.
    pub force: bool,
    pub concurrency: usize,
    /// Pause before each subject after the first.
    pub delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            force: false,
            concurrency: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Per-subject processing settings shared by batch runs and the service.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub model_name: String,
    pub detector_backend: String,
    pub preprocess: PreprocessConfig,
    pub extract_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            model_name: config.model_name.clone(),
            detector_backend: config.detector_backend.clone(),
            preprocess: config.preprocess,
            extract_retry: config.extract_retry(),
            store_retry: config.store_retry(),
        }
    }
}

pub struct BatchOrchestrator<R> {
    roster: R,
    fetcher: ImageFetcher,
    extractor: Arc<dyn FaceExtractor>,
    store: EmbeddingStore,
    settings: PipelineSettings,
}

impl<R: RosterSource> BatchOrchestrator<R> {
    pub fn new(
        roster: R,
        fetcher: ImageFetcher,
        extractor: Arc<dyn FaceExtractor>,
        store: EmbeddingStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            roster,
            fetcher,
            extractor,
            store,
            settings,
        }
    }

    pub fn roster(&self) -> &R {
        &self.roster
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn extractor(&self) -> &Arc<dyn FaceExtractor> {
        &self.extractor
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Resolve the subjects a run covers.
    pub async fn candidates(&self, scope: &RunScope) -> Result<Vec<Subject>, RunError> {
        match scope {
            RunScope::All => Ok(self.roster.active_subjects().await?),
            RunScope::Subject(id) => self
                .roster
                .subject(id)
                .await?
                .map(|s| vec![s])
                .ok_or_else(|| RunError::SubjectNotFound(id.clone())),
        }
    }

    pub async fn run(
        &self,
        scope: &RunScope,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        self.run_with(scope, options, cancel, |_| {}).await
    }

    /// Run a batch, calling `on_report` as each subject finishes.
    pub async fn run_with<F>(
        &self,
        scope: &RunScope,
        options: &BatchOptions,
        cancel: &CancellationToken,
        mut on_report: F,
    ) -> Result<RunSummary, RunError>
    where
        F: FnMut(&SubjectReport),
    {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let subjects = self.candidates(scope).await?;
        let concurrency = options.concurrency.max(1);

        tracing::info!(
            %run_id,
            subjects = subjects.len(),
            force = options.force,
            concurrency,
            "batch started"
        );

        let mut summary = RunSummary::new(run_id);
        let results = futures::stream::iter(subjects.iter().enumerate())
            .map(|(index, subject)| async move {
                if index > 0 && !options.delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(options.delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.process_subject(subject, options.force).await)
            })
            .buffer_unordered(concurrency);
        let mut results = std::pin::pin!(results);

        while let Some(result) = results.next().await {
            match result {
                Some(report) => {
                    on_report(&report);
                    summary.record(report);
                }
                None => summary.not_attempted += 1,
            }
        }

        summary.elapsed = started.elapsed();
        tracing::info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            not_attempted = summary.not_attempted,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            avg_ms = summary.average_latency().as_millis() as u64,
            "batch finished"
        );
        if summary.not_attempted > 0 {
            tracing::warn!(
                %run_id,
                not_attempted = summary.not_attempted,
                "batch cancelled before completion"
            );
        }
        Ok(summary)
    }

    /// Run one subject through every stage.
    pub async fn process_subject(&self, subject: &Subject, force: bool) -> SubjectReport {
        let started = Instant::now();
        let span = tracing::info_span!("subject", subject_id = %subject.subject_id);
        let outcome = self.process_stages(subject, force).instrument(span).await;
        SubjectReport {
            subject: subject.clone(),
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn process_stages(&self, subject: &Subject, force: bool) -> SubjectOutcome {
        if !force {
            match self.store.get_active(&subject.subject_id).await {
                Ok(Some(record)) => {
                    tracing::info!(record_id = record.id, "already enrolled, skipping");
                    return SubjectOutcome::Skipped { record };
                }
                Ok(None) => {}
                Err(err) => return fail(StageError::store(Stage::Pending, err)),
            }
        }

        tracing::debug!(stage = %Stage::Fetching, image = %subject.image, "downloading");
        let fetched = match self.fetcher.fetch(&subject.subject_id, &subject.image).await {
            Ok(fetched) => fetched,
            Err(err) => {
                let kind = FailureKind::Fetch(err.kind());
                return fail(StageError::new(Stage::Fetching, kind, err));
            }
        };
        let source_image_ref = fetched.url.to_string();

        tracing::debug!(stage = %Stage::Preprocessing, bytes = fetched.bytes.len(), "normalizing");
        let image = match preprocess_blocking(fetched.bytes, self.settings.preprocess).await {
            Ok(image) => image,
            Err(err) => return fail(err),
        };

        tracing::debug!(
            stage = %Stage::Extracting,
            width = image.width(),
            height = image.height(),
            "extracting"
        );
        let extracted = match extract_with_retry(&self.extractor, image, &self.settings).await {
            Ok(extracted) => extracted,
            Err(err) => {
                let kind = FailureKind::Extraction(err.kind());
                return fail(StageError::new(Stage::Extracting, kind, err));
            }
        };

        tracing::debug!(stage = %Stage::Storing, confidence = extracted.confidence, "storing");
        let new = NewEmbedding {
            subject_id: subject.subject_id.clone(),
            embedding: extracted.embedding,
            confidence: extracted.confidence,
            source_image_ref,
        };
        let upserted = retry_with_backoff(
            &self.settings.store_retry,
            "store_embedding",
            |e: &StoreError| e.is_retryable(),
            |_| self.store.upsert(new.clone(), force),
        )
        .await;

        match upserted {
            Ok(up) => match up.action {
                UpsertAction::Unchanged => {
                    tracing::info!(record_id = up.record.id, "enrolled concurrently, skipping");
                    SubjectOutcome::Skipped { record: up.record }
                }
                UpsertAction::Inserted => {
                    tracing::info!(
                        record_id = up.record.id,
                        dimension = up.record.dimension(),
                        "enrolled"
                    );
                    SubjectOutcome::Succeeded {
                        record: up.record,
                        replaced: None,
                    }
                }
                UpsertAction::Replaced { previous_id } => {
                    tracing::info!(record_id = up.record.id, previous_id, "re-enrolled");
                    SubjectOutcome::Succeeded {
                        record: up.record,
                        replaced: Some(previous_id),
                    }
                }
            },
            Err(err) => fail(StageError::store(Stage::Storing, err)),
        }
    }
}

fn fail(err: StageError) -> SubjectOutcome {
    tracing::warn!(stage = %err.stage, kind = %err.kind, error = %err.message, "subject failed");
    SubjectOutcome::Failed(err)
}

/// Decode and normalize on the blocking pool.
pub(crate) async fn preprocess_blocking(
    bytes: Vec<u8>,
    config: PreprocessConfig,
) -> Result<NormalizedImage, StageError> {
    match tokio::task::spawn_blocking(move || preprocess(&bytes, &config)).await {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(err)) => Err(StageError::new(Stage::Preprocessing, FailureKind::Decode, err)),
        Err(err) => Err(StageError::new(Stage::Preprocessing, FailureKind::Task, err)),
    }
}

/// Run the extractor on the blocking pool, retrying backend failures.
pub(crate) async fn extract_with_retry(
    extractor: &Arc<dyn FaceExtractor>,
    image: NormalizedImage,
    settings: &PipelineSettings,
) -> Result<ExtractedFace, ExtractionError> {
    let image = Arc::new(image);
    retry_with_backoff(
        &settings.extract_retry,
        "extract_embedding",
        |e: &ExtractionError| e.is_retryable(),
        |_| {
            let extractor = Arc::clone(extractor);
            let image = Arc::clone(&image);
            let model = settings.model_name.clone();
            let backend = settings.detector_backend.clone();
            async move {
                tokio::task::spawn_blocking(move || extractor.extract(&image, &model, &backend))
                    .await
                    .unwrap_or_else(|e| {
                        Err(ExtractionError::Backend(format!(
                            "extraction task failed: {e}"
                        )))
                    })
            }
        },
    )
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::roster::StaticRoster;
    use crewface_core::{BoundingBox, Embedding};
    use crewface_image::FetchConfig;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) const MODEL: &str = "Facenet512";

    /// Extractor double: the embedding is derived from the image width so
    /// each test photo maps to a distinct, predictable vector. Widths listed
    /// in `no_face` fail with `NoFaceDetected`.
    pub(crate) struct WidthExtractor {
        pub no_face: Vec<u32>,
        pub backend_failures: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl WidthExtractor {
        pub(crate) fn new() -> Self {
            Self {
                no_face: Vec::new(),
                backend_failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn vector_for(width: u32) -> Vec<f32> {
            let angle = width as f32 / 100.0;
            vec![angle.cos(), angle.sin(), 0.0]
        }
    }

    impl FaceExtractor for WidthExtractor {
        fn extract(
            &self,
            image: &NormalizedImage,
            model_name: &str,
            _detector_backend: &str,
        ) -> Result<ExtractedFace, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .backend_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExtractionError::Backend("session busy".into()));
            }
            if self.no_face.contains(&image.width()) {
                return Err(ExtractionError::NoFaceDetected);
            }
            let face = BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 50.0,
                height: 50.0,
                confidence: 0.9,
                landmarks: None,
            };
            Ok(ExtractedFace {
                embedding: Embedding::new(Self::vector_for(image.width()), model_name),
                confidence: face.confidence,
                face,
                faces_detected: 1,
            })
        }
    }

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::new(width, height);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
        }
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .expect("encode png");
        buf.into_inner()
    }

    pub(crate) fn settings() -> PipelineSettings {
        PipelineSettings {
            model_name: MODEL.into(),
            detector_backend: "scrfd".into(),
            preprocess: PreprocessConfig::default(),
            extract_retry: RetryPolicy::new(2, Duration::from_millis(1)),
            store_retry: RetryPolicy::new(2, Duration::from_millis(1)),
        }
    }

    pub(crate) fn fetcher(base: &str) -> ImageFetcher {
        let mut config = FetchConfig::new(Url::parse(base).expect("base url"));
        config.retry = RetryPolicy::new(1, Duration::from_millis(1));
        config.timeout = Duration::from_secs(5);
        ImageFetcher::new(config).expect("fetcher")
    }

    /// Subjects `0..n`, each with a distinct photo width `200 + i`.
    async fn serve_subjects(server: &MockServer, n: u32, missing: &[u32]) -> Vec<Subject> {
        let mut subjects = Vec::new();
        for i in 0..n {
            let id = format!("{}", 1000 + i);
            let file = format!("photo {i}.png");
            let template = if missing.contains(&i) {
                ResponseTemplate::new(404)
            } else {
                ResponseTemplate::new(200).set_body_raw(png_bytes(200 + i, 200), "image/png")
            };
            Mock::given(method("GET"))
                .and(path(format!("/Cultura/{id}/photo%20{i}.png")))
                .respond_with(template)
                .mount(server)
                .await;
            subjects.push(Subject::new(id, file).with_names("Crew", format!("Member {i}")));
        }
        subjects
    }

    async fn orchestrator(
        server: &MockServer,
        subjects: Vec<Subject>,
        extractor: Arc<WidthExtractor>,
    ) -> BatchOrchestrator<StaticRoster> {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        BatchOrchestrator::new(
            StaticRoster::new(subjects),
            fetcher(&format!("{}/Cultura", server.uri())),
            extractor,
            store,
            settings(),
        )
    }

    #[tokio::test]
    async fn test_batch_continues_past_failed_subject() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 10, &[1]).await;
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;

        let mut seen = Vec::new();
        let summary = orch
            .run_with(&RunScope::All, &BatchOptions::default(), &CancellationToken::new(), |r| {
                seen.push(r.subject.subject_id.clone())
            })
            .await
            .expect("run");

        assert_eq!(summary.succeeded, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.not_attempted, 0);
        assert_eq!(seen.len(), 10);

        let failures: Vec<_> = summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.subject_id, "1001");
        assert_eq!(failures[0].1.stage, Stage::Fetching);
        assert_eq!(failures[0].1.kind, FailureKind::Fetch(FetchErrorKind::NotFound));

        assert_eq!(orch.store().active_count(MODEL).await.expect("count"), 9);
        let stored = orch.store().get_active("1002").await.expect("query").expect("record");
        assert_eq!(stored.vector, WidthExtractor::vector_for(202));
        assert!(stored.source_image_ref.ends_with("/Cultura/1002/photo%202.png"));
    }

    #[tokio::test]
    async fn test_rerun_skips_enrolled_without_download() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 3, &[]).await;
        let extractor = Arc::new(WidthExtractor::new());
        let orch = orchestrator(&server, subjects, Arc::clone(&extractor)).await;
        let cancel = CancellationToken::new();

        let first = orch
            .run(&RunScope::All, &BatchOptions::default(), &cancel)
            .await
            .expect("first run");
        assert_eq!(first.succeeded, 3);
        let requests_after_first = server.received_requests().await.map(|r| r.len());

        let second = orch
            .run(&RunScope::All, &BatchOptions::default(), &cancel)
            .await
            .expect("second run");
        assert_eq!(second.skipped, 3);
        assert_eq!(second.succeeded, 0);
        assert_eq!(server.received_requests().await.map(|r| r.len()), requests_after_first);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forced_single_subject_replaces() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 2, &[]).await;
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;
        let cancel = CancellationToken::new();
        let scope = RunScope::Subject("1000".into());

        orch.run(&scope, &BatchOptions::default(), &cancel).await.expect("enroll");
        let forced = BatchOptions { force: true, ..BatchOptions::default() };
        let summary = orch.run(&scope, &forced, &cancel).await.expect("force");

        assert_eq!(summary.succeeded, 1);
        assert!(matches!(
            summary.reports[0].outcome,
            SubjectOutcome::Succeeded { replaced: Some(_), .. }
        ));
        let history = orch.store().history("1000").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
        assert_eq!(orch.store().get_active("1001").await.expect("query"), None);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_run_error() {
        let server = MockServer::start().await;
        let orch = orchestrator(&server, Vec::new(), Arc::new(WidthExtractor::new())).await;
        let err = orch
            .run(
                &RunScope::Subject("404".into()),
                &BatchOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("missing subject");
        assert!(matches!(err, RunError::SubjectNotFound(id) if id == "404"));
    }

    #[tokio::test]
    async fn test_extraction_failure_recorded_with_stage() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 2, &[]).await;
        let extractor = Arc::new(WidthExtractor {
            no_face: vec![201],
            ..WidthExtractor::new()
        });
        let orch = orchestrator(&server, subjects, extractor).await;

        let summary = orch
            .run(&RunScope::All, &BatchOptions::default(), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        let (subject, err) = summary.failures().next().expect("one failure");
        assert_eq!(subject.subject_id, "1001");
        assert_eq!(err.stage, Stage::Extracting);
        assert_eq!(err.kind, FailureKind::Extraction(ExtractionErrorKind::NoFaceDetected));
        assert_eq!(err.kind.to_string(), "NoFaceDetected");
    }

    #[tokio::test]
    async fn test_backend_errors_are_retried() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 1, &[]).await;
        let extractor = Arc::new(WidthExtractor {
            backend_failures: AtomicUsize::new(2),
            ..WidthExtractor::new()
        });
        let orch = orchestrator(&server, subjects, Arc::clone(&extractor)).await;

        let summary = orch
            .run(&RunScope::All, &BatchOptions::default(), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_content_fails_fetch_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html>login</html>", "text/html"),
            )
            .mount(&server)
            .await;
        let subjects = vec![Subject::new("1", "a.jpg")];
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;

        let summary = orch
            .run(&RunScope::All, &BatchOptions::default(), &CancellationToken::new())
            .await
            .expect("run");
        let (_, err) = summary.failures().next().expect("failure");
        assert_eq!(err.kind, FailureKind::Fetch(FetchErrorKind::InvalidContent));
    }

    #[tokio::test]
    async fn test_cancelled_run_attempts_nothing() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 4, &[]).await;
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = orch
            .run(&RunScope::All, &BatchOptions::default(), &cancel)
            .await
            .expect("run");
        assert_eq!(summary.not_attempted, 4);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.average_latency(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_leaves_rest_unattempted() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 5, &[]).await;
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;
        let cancel = CancellationToken::new();

        let summary = orch
            .run_with(&RunScope::All, &BatchOptions::default(), &cancel, |_| cancel.cancel())
            .await
            .expect("run");
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.not_attempted, 4);
    }

    #[tokio::test]
    async fn test_concurrent_batch_processes_everyone() {
        let server = MockServer::start().await;
        let subjects = serve_subjects(&server, 8, &[3]).await;
        let orch = orchestrator(&server, subjects, Arc::new(WidthExtractor::new())).await;
        let options = BatchOptions {
            concurrency: 4,
            delay: Duration::from_millis(1),
            ..BatchOptions::default()
        };

        let summary = orch
            .run(&RunScope::All, &options, &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!((summary.succeeded, summary.failed), (7, 1));
        assert_eq!(orch.store().active_count(MODEL).await.expect("count"), 7);
    }

    #[test]
    fn test_stage_error_display() {
        let kind = FailureKind::Fetch(FetchErrorKind::Timeout);
        let err = StageError::new(Stage::Fetching, kind, "timed out");
        assert_eq!(err.to_string(), "fetching failed (Timeout): timed out");
    }
}
