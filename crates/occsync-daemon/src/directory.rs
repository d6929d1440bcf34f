//! SQLite-backed tenant directory and occurrence projection store.
//!
//! Two families of tables live here with different writers:
//!
//! - The tenant directory (`workstation`, `workstation_user`) is mutated
//!   only by provisioning/membership operations.
//! - The occurrence projection (`occurrence`, `places`,
//!   `classification_json`) is populated exclusively by the reconciliation
//!   engine — request handlers never write it. Primary keys are the
//!   client-generated document identifiers carried over verbatim; this
//!   store never mints identities for synchronized records.
//!
//! [`Directory::upsert_occurrence`] is the single write path for a
//! reconciled document: classification, place, and occurrence rows commit
//! or roll back together inside one transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Membership role granted to the user who creates a workstation.
pub const ADMIN_ROLE_ID: i64 = 1;

const SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS workstation (
        workstation_id INTEGER PRIMARY KEY AUTOINCREMENT,
        workstation_name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS workstation_user (
        workstation_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        PRIMARY KEY (workstation_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS occurrence (
        occurrence_id TEXT PRIMARY KEY,
        workstation_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        project_id TEXT NOT NULL DEFAULT '',
        individual_id TEXT NOT NULL DEFAULT '',
        lifestage TEXT NOT NULL DEFAULT '',
        sex TEXT NOT NULL DEFAULT '',
        body_length REAL NOT NULL DEFAULT 0,
        note TEXT NOT NULL DEFAULT '',
        classification_id TEXT NOT NULL DEFAULT '',
        place_id TEXT NOT NULL DEFAULT '',
        language_id TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT '',
        timezone TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_occurrence_workstation
        ON occurrence(workstation_id);

    CREATE TABLE IF NOT EXISTS places (
        place_id TEXT PRIMARY KEY,
        place_name_id TEXT,
        coordinates TEXT NOT NULL DEFAULT 'null',
        accuracy REAL NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS classification_json (
        classification_id TEXT PRIMARY KEY,
        class_classification TEXT NOT NULL DEFAULT 'null'
    );
";

/// Errors from the relational store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// A uniqueness constraint was violated (e.g. duplicate membership).
    ///
    /// Client-correctable; maps to HTTP 409, never a server fault.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other database failure.
    #[error("database error: {0}")]
    Database(String),
}

fn map_sqlite(context: &str, err: rusqlite::Error) -> DirectoryError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return DirectoryError::Conflict(format!("{context}: {err}"));
        }
    }
    DirectoryError::Database(format!("{context}: {err}"))
}

/// A tenant unit. Owns exactly one document-store database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workstation {
    /// Server-generated identity.
    pub workstation_id: i64,
    /// Display name.
    pub workstation_name: String,
}

/// A user's membership in a workstation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Workstation half of the composite key.
    pub workstation_id: i64,
    /// User half of the composite key.
    pub user_id: i64,
    /// Role within the workstation (admin = 1).
    pub role_id: i64,
}

/// Relational projection of an occurrence document.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceRow {
    /// Client-generated identifier, carried over verbatim.
    pub occurrence_id: String,
    pub workstation_id: i64,
    pub user_id: i64,
    pub project_id: String,
    pub individual_id: String,
    pub lifestage: String,
    pub sex: String,
    pub body_length: f64,
    pub note: String,
    pub classification_id: String,
    pub place_id: String,
    pub language_id: String,
    /// RFC3339 creation timestamp.
    pub created_at: String,
    pub timezone: String,
}

/// Relational projection of a nested place object.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRow {
    pub place_id: String,
    pub place_name_id: Option<String>,
    /// Serialized coordinate JSON.
    pub coordinates: String,
    pub accuracy: f64,
}

/// Relational projection of a nested classification object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRow {
    pub classification_id: String,
    /// Serialized classification JSON.
    pub class_classification: String,
}

/// Everything one reconciled document writes, as one transactional unit.
#[derive(Debug, Clone)]
pub struct OccurrenceBundle {
    /// Classification satellite row, absent when the document carried no
    /// classification id.
    pub classification: Option<ClassificationRow>,
    /// Place satellite row, absent when the document carried no place id.
    pub place: Option<PlaceRow>,
    /// The occurrence row itself.
    pub occurrence: OccurrenceRow,
}

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Directory {
    conn: Arc<Mutex<Connection>>,
}

impl Directory {
    /// Open (or create) the store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Database`] if the file cannot be opened
    /// or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| map_sqlite("open", e))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Database`] if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, DirectoryError> {
        let conn = Connection::open_in_memory().map_err(|e| map_sqlite("open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, DirectoryError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| map_sqlite("schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a workstation row and return it with its new identity.
    pub fn create_workstation(&self, name: &str) -> Result<Workstation, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workstation (workstation_name) VALUES (?1)",
            params![name],
        )
        .map_err(|e| map_sqlite("create_workstation", e))?;

        Ok(Workstation {
            workstation_id: conn.last_insert_rowid(),
            workstation_name: name.to_string(),
        })
    }

    /// Add a user to a workstation with the given role.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Conflict`] if the membership already
    /// exists.
    pub fn add_member(
        &self,
        workstation_id: i64,
        user_id: i64,
        role_id: i64,
    ) -> Result<(), DirectoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workstation_user (workstation_id, user_id, role_id)
             VALUES (?1, ?2, ?3)",
            params![workstation_id, user_id, role_id],
        )
        .map_err(|e| map_sqlite("add_member", e))?;
        Ok(())
    }

    /// All workstations, for the reconciliation sweep.
    pub fn list_workstations(&self) -> Result<Vec<Workstation>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT workstation_id, workstation_name FROM workstation ORDER BY workstation_id")
            .map_err(|e| map_sqlite("list_workstations", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Workstation {
                    workstation_id: row.get(0)?,
                    workstation_name: row.get(1)?,
                })
            })
            .map_err(|e| map_sqlite("list_workstations", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite("list_workstations", e))?;
        Ok(rows)
    }

    /// All membership relations, for the provisioning repair sweep.
    pub fn list_memberships(&self) -> Result<Vec<Membership>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT workstation_id, user_id, role_id FROM workstation_user
                 ORDER BY workstation_id, user_id",
            )
            .map_err(|e| map_sqlite("list_memberships", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Membership {
                    workstation_id: row.get(0)?,
                    user_id: row.get(1)?,
                    role_id: row.get(2)?,
                })
            })
            .map_err(|e| map_sqlite("list_memberships", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite("list_memberships", e))?;
        Ok(rows)
    }

    /// Workstations the given user is a member of.
    pub fn workstations_for_user(&self, user_id: i64) -> Result<Vec<Workstation>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT w.workstation_id, w.workstation_name
                 FROM workstation w
                 JOIN workstation_user wu ON w.workstation_id = wu.workstation_id
                 WHERE wu.user_id = ?1
                 ORDER BY w.workstation_id",
            )
            .map_err(|e| map_sqlite("workstations_for_user", e))?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(Workstation {
                    workstation_id: row.get(0)?,
                    workstation_name: row.get(1)?,
                })
            })
            .map_err(|e| map_sqlite("workstations_for_user", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite("workstations_for_user", e))?;
        Ok(rows)
    }

    /// User ids of a workstation's members.
    pub fn members_of(&self, workstation_id: i64) -> Result<Vec<i64>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM workstation_user WHERE workstation_id = ?1 ORDER BY user_id",
            )
            .map_err(|e| map_sqlite("members_of", e))?;
        let rows = stmt
            .query_map(params![workstation_id], |row| row.get(0))
            .map_err(|e| map_sqlite("members_of", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite("members_of", e))?;
        Ok(rows)
    }

    /// Upsert one reconciled document: classification, then place, then
    /// occurrence, strictly ordered inside a single transaction.
    ///
    /// `INSERT OR REPLACE` by primary key makes reprocessing idempotent:
    /// the same document, same or changed content, always converges to the
    /// most recently reconciled version.
    pub fn upsert_occurrence(&self, bundle: &OccurrenceBundle) -> Result<(), DirectoryError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| map_sqlite("upsert_occurrence", e))?;

        if let Some(classification) = &bundle.classification {
            tx.execute(
                "INSERT OR REPLACE INTO classification_json
                 (classification_id, class_classification) VALUES (?1, ?2)",
                params![
                    classification.classification_id,
                    classification.class_classification
                ],
            )
            .map_err(|e| map_sqlite("upsert classification", e))?;
        }

        if let Some(place) = &bundle.place {
            tx.execute(
                "INSERT OR REPLACE INTO places
                 (place_id, place_name_id, coordinates, accuracy)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    place.place_id,
                    place.place_name_id,
                    place.coordinates,
                    place.accuracy
                ],
            )
            .map_err(|e| map_sqlite("upsert place", e))?;
        }

        let occurrence = &bundle.occurrence;
        tx.execute(
            "INSERT OR REPLACE INTO occurrence
             (occurrence_id, workstation_id, user_id, project_id, individual_id,
              lifestage, sex, body_length, note, classification_id, place_id,
              language_id, created_at, timezone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                occurrence.occurrence_id,
                occurrence.workstation_id,
                occurrence.user_id,
                occurrence.project_id,
                occurrence.individual_id,
                occurrence.lifestage,
                occurrence.sex,
                occurrence.body_length,
                occurrence.note,
                occurrence.classification_id,
                occurrence.place_id,
                occurrence.language_id,
                occurrence.created_at,
                occurrence.timezone
            ],
        )
        .map_err(|e| map_sqlite("upsert occurrence", e))?;

        tx.commit().map_err(|e| map_sqlite("upsert_occurrence", e))
    }

    /// Fetch an occurrence row by id.
    pub fn get_occurrence(&self, occurrence_id: &str) -> Result<Option<OccurrenceRow>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT occurrence_id, workstation_id, user_id, project_id, individual_id,
                    lifestage, sex, body_length, note, classification_id, place_id,
                    language_id, created_at, timezone
             FROM occurrence WHERE occurrence_id = ?1",
            params![occurrence_id],
            |row| {
                Ok(OccurrenceRow {
                    occurrence_id: row.get(0)?,
                    workstation_id: row.get(1)?,
                    user_id: row.get(2)?,
                    project_id: row.get(3)?,
                    individual_id: row.get(4)?,
                    lifestage: row.get(5)?,
                    sex: row.get(6)?,
                    body_length: row.get(7)?,
                    note: row.get(8)?,
                    classification_id: row.get(9)?,
                    place_id: row.get(10)?,
                    language_id: row.get(11)?,
                    created_at: row.get(12)?,
                    timezone: row.get(13)?,
                })
            },
        )
        .optional()
        .map_err(|e| map_sqlite("get_occurrence", e))
    }

    /// Total number of occurrence rows.
    #[allow(clippy::cast_sign_loss)]
    pub fn count_occurrences(&self) -> Result<usize, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM occurrence", [], |row| row.get(0))
            .map_err(|e| map_sqlite("count_occurrences", e))?;
        Ok(count as usize)
    }

    /// Fetch a place row by id.
    pub fn get_place(&self, place_id: &str) -> Result<Option<PlaceRow>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT place_id, place_name_id, coordinates, accuracy FROM places
             WHERE place_id = ?1",
            params![place_id],
            |row| {
                Ok(PlaceRow {
                    place_id: row.get(0)?,
                    place_name_id: row.get(1)?,
                    coordinates: row.get(2)?,
                    accuracy: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| map_sqlite("get_place", e))
    }

    /// Fetch a classification row by id.
    pub fn get_classification(
        &self,
        classification_id: &str,
    ) -> Result<Option<ClassificationRow>, DirectoryError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT classification_id, class_classification FROM classification_json
             WHERE classification_id = ?1",
            params![classification_id],
            |row| {
                Ok(ClassificationRow {
                    classification_id: row.get(0)?,
                    class_classification: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| map_sqlite("get_classification", e))
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").finish_non_exhaustive()
    }
}
