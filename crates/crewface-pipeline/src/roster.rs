//! Read-only access to the people to enroll.

use rusqlite::{params, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RosterError {
    #[error("roster unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio_rusqlite::Error> for RosterError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<rusqlite::Error> for RosterError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// A person whose photo can be enrolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub subject_id: String,
    pub first_names: String,
    pub last_names: String,
    /// Photo filename relative to the subject's directory.
    pub image: String,
}

impl Subject {
    pub fn new(subject_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            first_names: String::new(),
            last_names: String::new(),
            image: image.into(),
        }
    }

    pub fn with_names(
        mut self,
        first_names: impl Into<String>,
        last_names: impl Into<String>,
    ) -> Self {
        self.first_names = first_names.into();
        self.last_names = last_names.into();
        self
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_names.trim(), self.last_names.trim())
            .trim()
            .to_string()
    }

    fn has_image(&self) -> bool {
        !self.image.trim().is_empty()
    }
}

/// Source of enrollable subjects. Only active subjects with a photo are
/// ever returned.
pub trait RosterSource: Send + Sync {
    fn active_subjects(&self) -> impl Future<Output = Result<Vec<Subject>, RosterError>> + Send;

    fn subject(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = Result<Option<Subject>, RosterError>> + Send;
}

/// Roster backed by the `crew` table (`status = 1` is active).
#[derive(Clone)]
pub struct SqliteRoster {
    conn: tokio_rusqlite::Connection,
}

const SELECT_SUBJECTS: &str = "SELECT CAST(crew_id AS TEXT), COALESCE(first_names, ''),
            COALESCE(last_names, ''), image
     FROM crew
     WHERE status = 1 AND image IS NOT NULL AND TRIM(image) != ''";

impl SqliteRoster {
    /// Open the roster database read-only.
    pub async fn open(path: &Path) -> Result<Self, RosterError> {
        let conn = tokio_rusqlite::Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .await?;
        tracing::info!(path = %path.display(), "roster opened");
        Ok(Self { conn })
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: tokio_rusqlite::Connection) -> Self {
        Self { conn }
    }
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        subject_id: row.get(0)?,
        first_names: row.get(1)?,
        last_names: row.get(2)?,
        image: row.get::<_, String>(3)?.trim().to_string(),
    })
}

impl RosterSource for SqliteRoster {
    async fn active_subjects(&self) -> Result<Vec<Subject>, RosterError> {
        let subjects = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_SUBJECTS} ORDER BY crew_id"))?;
                let rows = stmt
                    .query_map([], subject_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(subjects)
    }

    async fn subject(&self, subject_id: &str) -> Result<Option<Subject>, RosterError> {
        let subject_id = subject_id.to_string();
        let subject = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("{SELECT_SUBJECTS} AND CAST(crew_id AS TEXT) = ?1"),
                        params![subject_id],
                        subject_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(subject)
    }
}

/// In-memory roster.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    subjects: Vec<Subject>,
}

impl StaticRoster {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }
}

impl RosterSource for StaticRoster {
    async fn active_subjects(&self) -> Result<Vec<Subject>, RosterError> {
        Ok(self.subjects.iter().filter(|s| s.has_image()).cloned().collect())
    }

    async fn subject(&self, subject_id: &str) -> Result<Option<Subject>, RosterError> {
        Ok(self
            .subjects
            .iter()
            .find(|s| s.subject_id == subject_id && s.has_image())
            .cloned())
    }
}
