//! Embedding persistence in SQLite.
//!
//! Each subject has at most one active record. Re-enrollment deactivates the
//! previous record instead of deleting it, so `history` is a full audit trail.

use chrono::{DateTime, Utc};
use crewface_core::{Embedding, GalleryEntry};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS face_embeddings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  subject_id TEXT NOT NULL,
  embedding TEXT NOT NULL,
  model_name TEXT NOT NULL,
  confidence REAL NOT NULL,
  source_image_ref TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_subject ON face_embeddings(subject_id);
CREATE INDEX IF NOT EXISTS idx_face_embeddings_subject_active
  ON face_embeddings(subject_id, active);
CREATE UNIQUE INDEX IF NOT EXISTS uq_face_embeddings_active_subject
  ON face_embeddings(subject_id) WHERE active = 1;
"#;

const RECORD_COLUMNS: &str = "id, subject_id, embedding, model_name, confidence, \
     source_image_ref, active, created_at, updated_at";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("no active embedding for subject {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("database error: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    NotFound,
    ConstraintViolation,
    ConnectionError,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "NotFound",
            Self::ConstraintViolation => "ConstraintViolation",
            Self::ConnectionError => "ConnectionError",
        })
    }
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            Self::NotFound(_) => StoreErrorKind::NotFound,
            Self::ConstraintViolation(_) => StoreErrorKind::ConstraintViolation,
            Self::Connection(_) => StoreErrorKind::ConnectionError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Self::ConstraintViolation(err.to_string())
            }
            _ => Self::Connection(err.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => e.into(),
            other => Self::Connection(other.to_string()),
        }
    }
}

/// An embedding about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEmbedding {
    pub subject_id: String,
    pub embedding: Embedding,
    pub confidence: f32,
    pub source_image_ref: String,
}

/// A stored embedding row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub subject_id: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub confidence: f32,
    pub source_image_ref: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertAction {
    Inserted,
    /// The previously active record was deactivated.
    Replaced { previous_id: i64 },
    /// An active record already existed and `force` was not set.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub record: EmbeddingRecord,
    pub action: UpsertAction,
}

/// Handle to the embedding database. Cheap to clone; all clones share one
/// background connection thread.
#[derive(Clone)]
pub struct EmbeddingStore {
    conn: tokio_rusqlite::Connection,
}

impl EmbeddingStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connection(format!("create {}: {e}", parent.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        })
        .await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "embedding store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Write an embedding for `new.subject_id`.
    ///
    /// Without `force`, an existing active record is returned as-is
    /// (`Unchanged`). With `force`, it is deactivated and the new record
    /// inserted in the same transaction.
    pub async fn upsert(&self, new: NewEmbedding, force: bool) -> Result<Upserted, StoreError> {
        let upserted = self.conn.call(move |conn| Ok(upsert_in_tx(conn, &new, force))).await??;
        tracing::debug!(
            subject_id = %upserted.record.subject_id,
            id = upserted.record.id,
            action = ?upserted.action,
            "embedding upserted"
        );
        Ok(upserted)
    }

    /// Active embeddings for `model_name`, ordered by subject.
    pub async fn get_active_gallery(
        &self,
        model_name: &str,
    ) -> Result<Vec<GalleryEntry>, StoreError> {
        let model_name = model_name.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, embedding FROM face_embeddings
                     WHERE active = 1 AND model_name = ?1
                     ORDER BY subject_id",
                )?;
                let rows = stmt
                    .query_map(params![model_name], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (subject_id, json) in rows {
            match serde_json::from_str::<Vec<f32>>(&json) {
                Ok(vector) => gallery.push(GalleryEntry { subject_id, vector }),
                Err(e) => tracing::warn!(%subject_id, error = %e, "skipping undecodable embedding"),
            }
        }
        Ok(gallery)
    }

    pub async fn get_active(
        &self,
        subject_id: &str,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let subject_id = subject_id.to_string();
        self.conn.call(move |conn| Ok(select_active(conn, &subject_id))).await?
    }

    /// Every record ever written for `subject_id`, oldest first.
    pub async fn history(&self, subject_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let subject_id = subject_id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM face_embeddings
                     WHERE subject_id = ?1 ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![subject_id], RawRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(RawRecord::decode).collect()
    }

    /// Deactivate the active record for `subject_id`.
    pub async fn deactivate(&self, subject_id: &str) -> Result<(), StoreError> {
        let id = subject_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE face_embeddings SET active = 0, updated_at = ?1
                     WHERE subject_id = ?2 AND active = 1",
                    params![Utc::now(), id],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(subject_id.to_string()));
        }
        tracing::info!(subject_id, "embedding deactivated");
        Ok(())
    }

    pub async fn active_count(&self, model_name: &str) -> Result<usize, StoreError> {
        let model_name = model_name.to_string();
        let count = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM face_embeddings WHERE active = 1 AND model_name = ?1",
                    params![model_name],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await?;
        Ok(count as usize)
    }
}

fn upsert_in_tx(
    conn: &mut Connection,
    new: &NewEmbedding,
    force: bool,
) -> Result<Upserted, StoreError> {
    if !new.embedding.is_well_formed() {
        return Err(StoreError::ConstraintViolation(format!(
            "embedding for {} is empty or not finite",
            new.subject_id
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = select_active(&tx, &new.subject_id)?;
    if let Some(record) = existing.as_ref().filter(|_| !force) {
        return Ok(Upserted {
            record: record.clone(),
            action: UpsertAction::Unchanged,
        });
    }

    let expected_dim: Option<i64> = tx
        .query_row(
            "SELECT json_array_length(embedding) FROM face_embeddings
             WHERE model_name = ?1 AND json_valid(embedding) LIMIT 1",
            params![new.embedding.model_name],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();
    if let Some(dim) = expected_dim {
        if dim as usize != new.embedding.dimension() {
            return Err(StoreError::ConstraintViolation(format!(
                "{} embeddings have {dim} dimensions, got {}",
                new.embedding.model_name,
                new.embedding.dimension()
            )));
        }
    }

    let now = Utc::now();
    let previous_id = match existing {
        Some(previous) => {
            tx.execute(
                "UPDATE face_embeddings SET active = 0, updated_at = ?1 WHERE id = ?2",
                params![now, previous.id],
            )?;
            Some(previous.id)
        }
        None => None,
    };

    let json = serde_json::to_string(&new.embedding.values)
        .map_err(|e| StoreError::ConstraintViolation(format!("serialize embedding: {e}")))?;
    tx.execute(
        "INSERT INTO face_embeddings
           (subject_id, embedding, model_name, confidence, source_image_ref,
            active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
        params![
            new.subject_id,
            json,
            new.embedding.model_name,
            new.confidence as f64,
            new.source_image_ref,
            now
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(Upserted {
        record: EmbeddingRecord {
            id,
            subject_id: new.subject_id.clone(),
            vector: new.embedding.values.clone(),
            model_name: new.embedding.model_name.clone(),
            confidence: new.confidence,
            source_image_ref: new.source_image_ref.clone(),
            active: true,
            created_at: now,
            updated_at: now,
        },
        action: match previous_id {
            Some(previous_id) => UpsertAction::Replaced { previous_id },
            None => UpsertAction::Inserted,
        },
    })
}

fn select_active(
    conn: &Connection,
    subject_id: &str,
) -> Result<Option<EmbeddingRecord>, StoreError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM face_embeddings WHERE subject_id = ?1 AND active = 1"
    );
    conn.query_row(&sql, params![subject_id], RawRecord::from_row)
        .optional()?
        .map(RawRecord::decode)
        .transpose()
}

/// A row before its JSON vector is decoded.
struct RawRecord {
    id: i64,
    subject_id: String,
    embedding: String,
    model_name: String,
    confidence: f64,
    source_image_ref: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            embedding: row.get(2)?,
            model_name: row.get(3)?,
            confidence: row.get(4)?,
            source_image_ref: row.get(5)?,
            active: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<EmbeddingRecord, StoreError> {
        let vector: Vec<f32> = serde_json::from_str(&self.embedding).map_err(|e| {
            StoreError::ConstraintViolation(format!(
                "record {} has corrupt embedding: {e}",
                self.id
            ))
        })?;
        Ok(EmbeddingRecord {
            id: self.id,
            subject_id: self.subject_id,
            vector,
            model_name: self.model_name,
            confidence: self.confidence as f32,
            source_image_ref: self.source_image_ref,
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_embedding(subject_id: &str, values: Vec<f32>) -> NewEmbedding {
        NewEmbedding {
            subject_id: subject_id.into(),
            embedding: Embedding::new(values, "Facenet512"),
            confidence: 0.93,
            source_image_ref: format!("https://host/Cultura/{subject_id}/photo.jpg"),
        }
    }

    #[tokio::test]
    async fn test_enroll_once() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        let up = store
            .upsert(new_embedding("789123", vec![0.1, 0.2, 0.3]), false)
            .await
            .expect("upsert");

        assert_eq!(up.action, UpsertAction::Inserted);
        assert!(up.record.active);
        assert_eq!(up.record.dimension(), 3);

        let active = store.get_active("789123").await.expect("query").expect("active record");
        assert_eq!(active.vector, vec![0.1, 0.2, 0.3]);
        assert_eq!(active.model_name, "Facenet512");
        assert!((active.confidence - 0.93).abs() < 1e-6);
        assert_eq!(store.active_count("Facenet512").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_non_forced_reenroll_is_noop() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        let first = store.upsert(new_embedding("1", vec![1.0, 0.0]), false).await.expect("first");
        let second = store.upsert(new_embedding("1", vec![0.0, 1.0]), false).await.expect("second");

        assert_eq!(second.action, UpsertAction::Unchanged);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.vector, vec![1.0, 0.0]);

        let history = store.history("1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].updated_at, first.record.updated_at);
    }

    #[tokio::test]
    async fn test_forced_reenroll_replaces() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        let first = store.upsert(new_embedding("1", vec![1.0, 0.0]), false).await.expect("first");
        let second = store.upsert(new_embedding("1", vec![0.0, 1.0]), true).await.expect("forced");

        assert_eq!(second.action, UpsertAction::Replaced { previous_id: first.record.id });

        let history = store.history("1").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.record.id);
        assert!(!history[0].active);
        assert!(history[1].active);
        assert_eq!(history[1].vector, vec![0.0, 1.0]);
        assert_eq!(history.iter().filter(|r| r.active).count(), 1);
    }

    #[tokio::test]
    async fn test_forced_enroll_without_existing_inserts() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        let up = store.upsert(new_embedding("9", vec![0.5, 0.5]), true).await.expect("upsert");
        assert_eq!(up.action, UpsertAction::Inserted);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected_and_previous_kept() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        store.upsert(new_embedding("1", vec![1.0, 0.0, 0.0]), false).await.expect("first");

        let err = store
            .upsert(new_embedding("1", vec![1.0, 0.0]), true)
            .await
            .expect_err("mismatch");
        assert_eq!(err.kind(), StoreErrorKind::ConstraintViolation);

        let active = store.get_active("1").await.expect("query").expect("still active");
        assert_eq!(active.dimension(), 3);
        assert_eq!(store.history("1").await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_vectors() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        let empty = store.upsert(new_embedding("1", vec![]), false).await;
        assert!(matches!(empty, Err(StoreError::ConstraintViolation(_))));
        let nan = store.upsert(new_embedding("1", vec![0.1, f32::NAN]), false).await;
        assert!(matches!(nan, Err(StoreError::ConstraintViolation(_))));
        assert_eq!(store.get_active("1").await.expect("query"), None);
    }

    #[tokio::test]
    async fn test_gallery_ordered_and_filtered_by_model() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        store.upsert(new_embedding("b", vec![0.0, 1.0]), false).await.expect("b");
        store.upsert(new_embedding("a", vec![1.0, 0.0]), false).await.expect("a");
        let mut other = new_embedding("c", vec![1.0; 4]);
        other.embedding.model_name = "ArcFace".into();
        store.upsert(other, false).await.expect("c");

        let gallery = store.get_active_gallery("Facenet512").await.expect("gallery");
        let ids: Vec<&str> = gallery.iter().map(|e| e.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.active_count("ArcFace").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_gallery_skips_corrupt_rows() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        store.upsert(new_embedding("good", vec![1.0, 0.0]), false).await.expect("good");
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO face_embeddings
                       (subject_id, embedding, model_name, confidence, source_image_ref,
                        active, created_at, updated_at)
                     VALUES ('bad', 'not json', 'Facenet512', 0.9, 'x', 1, ?1, ?1)",
                    params![Utc::now()],
                )?;
                Ok(())
            })
            .await
            .expect("raw insert");

        let gallery = store.get_active_gallery("Facenet512").await.expect("gallery");
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].subject_id, "good");
    }

    #[tokio::test]
    async fn test_partial_unique_index_enforced() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        store.upsert(new_embedding("1", vec![1.0, 0.0]), false).await.expect("first");
        let err = store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO face_embeddings
                       (subject_id, embedding, model_name, confidence, source_image_ref,
                        active, created_at, updated_at)
                     VALUES ('1', '[0.0,1.0]', 'Facenet512', 0.9, 'x', 1, ?1, ?1)",
                    params![Utc::now()],
                )?;
                Ok(())
            })
            .await
            .expect_err("second active row");
        assert_eq!(StoreError::from(err).kind(), StoreErrorKind::ConstraintViolation);
    }

    #[tokio::test]
    async fn test_deactivate() {
        let store = EmbeddingStore::open_in_memory().await.expect("store");
        store.upsert(new_embedding("1", vec![1.0, 0.0]), false).await.expect("first");

        store.deactivate("1").await.expect("deactivate");
        assert_eq!(store.get_active("1").await.expect("query"), None);
        assert_eq!(store.history("1").await.expect("history").len(), 1);
        assert_eq!(store.deactivate("1").await, Err(StoreError::NotFound("1".into())));
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/crewface.db");
        {
            let store = EmbeddingStore::open(&path).await.expect("open");
            store.upsert(new_embedding("1", vec![1.0, 0.0]), false).await.expect("upsert");
        }
        let reopened = EmbeddingStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.active_count("Facenet512").await.expect("count"), 1);
    }

    #[test]
    fn test_only_connection_errors_retry() {
        assert!(StoreError::Connection("busy".into()).is_retryable());
        assert!(!StoreError::NotFound("1".into()).is_retryable());
        assert!(!StoreError::ConstraintViolation("dup".into()).is_retryable());
    }
}
