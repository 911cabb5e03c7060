//! crewface-pipeline — from roster to stored embeddings, and back out as
//! matches.

pub mod config;
pub mod orchestrator;
pub mod roster;
pub mod service;
pub mod store;

pub use config::{Config, ConfigError};
pub use orchestrator::{
    BatchOptions, BatchOrchestrator, FailureKind, PipelineSettings, RunError, RunScope, RunSummary,
    Stage, StageError, SubjectOutcome, SubjectReport,
};
pub use roster::{RosterError, RosterSource, SqliteRoster, StaticRoster, Subject};
pub use service::{EnrollAction, EnrollError, EnrollResult, EnrollmentService, RecognizeError};
pub use store::{
    EmbeddingRecord, EmbeddingStore, NewEmbedding, StoreError, StoreErrorKind, UpsertAction,
    Upserted,
};
