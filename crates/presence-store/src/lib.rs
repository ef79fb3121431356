//! presence-store: SQLite persistence for registered faces and attendance.
//!
//! Implements the core's [`Roster`] and [`AttendanceLedger`] seams. The
//! attendance table carries a `UNIQUE(person_id, date)` constraint, so a
//! concurrent duplicate insert surfaces as [`InsertOutcome::Duplicate`].

use chrono::{NaiveDate, NaiveTime};
use presence_core::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, Embedding, InsertOutcome, RegisteredFace,
    Roster, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registered_faces (
    person_id       TEXT PRIMARY KEY NOT NULL,
    display_name    TEXT NOT NULL,
    embedding       BLOB,
    model_version   TEXT,
    reference_image TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id    TEXT NOT NULL,
    date         TEXT NOT NULL,
    time         TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('present', 'late')),
    confidence   REAL NOT NULL,
    capture_path TEXT,
    created_at   TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (person_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance (date);
";

const FACE_COLUMNS: &str = "person_id, display_name, embedding, model_version, reference_image";
const ATTENDANCE_COLUMNS: &str = "person_id, date, time, status, confidence, capture_path";

/// Per-person attendance counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSummary {
    pub total: u32,
    pub present: u32,
    pub late: u32,
    /// Share of records that were on time, in percent to one decimal (0 when there are none).
    pub on_time_percentage: f32,
}

/// SQLite-backed roster and attendance ledger.
pub struct Store {
    conn: Mutex<Connection>,
}

fn db(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

/// Columns as read from SQLite, before validation.
struct FaceRow {
    person_id: String,
    display_name: String,
    embedding: Option<Vec<u8>>,
    model_version: Option<String>,
    reference_image: Option<String>,
}

impl FaceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            person_id: row.get(0)?,
            display_name: row.get(1)?,
            embedding: row.get(2)?,
            model_version: row.get(3)?,
            reference_image: row.get(4)?,
        })
    }

    fn into_face(self) -> Result<RegisteredFace, StoreError> {
        let embedding = match self.embedding {
            Some(bytes) => {
                let Some(mut embedding) = Embedding::from_le_bytes(&bytes) else {
                    return Err(StoreError::Corrupt {
                        person_id: self.person_id,
                        detail: format!("embedding blob of {} bytes", bytes.len()),
                    });
                };
                embedding.model_version = self.model_version;
                Some(embedding)
            }
            None => None,
        };

        Ok(RegisteredFace {
            person_id: self.person_id,
            display_name: self.display_name,
            embedding,
            reference_image: self.reference_image.map(PathBuf::from),
        })
    }
}

struct AttendanceRow {
    person_id: String,
    date: String,
    time: String,
    status: String,
    confidence: f64,
    capture_path: Option<String>,
}

impl AttendanceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            person_id: row.get(0)?,
            date: row.get(1)?,
            time: row.get(2)?,
            status: row.get(3)?,
            confidence: row.get(4)?,
            capture_path: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let corrupt = |detail: String| StoreError::Corrupt {
            person_id: self.person_id.clone(),
            detail,
        };
        let date: NaiveDate = self
            .date
            .parse()
            .map_err(|e| corrupt(format!("date {:?}: {e}", self.date)))?;
        let time: NaiveTime = self
            .time
            .parse()
            .map_err(|e| corrupt(format!("time {:?}: {e}", self.time)))?;
        let status: AttendanceStatus = self.status.parse().map_err(corrupt)?;

        Ok(AttendanceRecord {
            person_id: self.person_id,
            date,
            time,
            status,
            confidence: self.confidence as f32,
            capture_path: self.capture_path.map(PathBuf::from),
        })
    }
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let conn = Connection::open(path).map_err(db)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "opened presence database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("database connection lock poisoned".into()))
    }

    /// Register a face, replacing any earlier registration for the same person.
    pub fn upsert_face(&self, face: &RegisteredFace) -> Result<(), StoreError> {
        let embedding = face.embedding.as_ref().map(Embedding::to_le_bytes);
        let model_version = face
            .embedding
            .as_ref()
            .and_then(|e| e.model_version.clone());
        let reference_image = face.reference_image.as_deref().map(path_text);

        self.conn()?
            .execute(
                "INSERT INTO registered_faces
                     (person_id, display_name, embedding, model_version, reference_image)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (person_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    embedding = excluded.embedding,
                    model_version = excluded.model_version,
                    reference_image = excluded.reference_image,
                    updated_at = datetime('now')",
                params![
                    face.person_id,
                    face.display_name,
                    embedding,
                    model_version,
                    reference_image,
                ],
            )
            .map_err(db)?;

        tracing::info!(
            person_id = %face.person_id,
            embedded = face.embedding.is_some(),
            "face registered"
        );
        Ok(())
    }

    /// Remove a person and their attendance history. Returns `false` if they were not registered.
    pub fn remove_face(&self, person_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "DELETE FROM attendance WHERE person_id = ?1",
            params![person_id],
        )
        .map_err(db)?;
        let removed = tx
            .execute(
                "DELETE FROM registered_faces WHERE person_id = ?1",
                params![person_id],
            )
            .map_err(db)?;
        tx.commit().map_err(db)?;

        tracing::info!(person_id, removed = removed > 0, "face removal");
        Ok(removed > 0)
    }

    pub fn list_faces(&self) -> Result<Vec<RegisteredFace>, StoreError> {
        let sql = format!(
            "SELECT {FACE_COLUMNS} FROM registered_faces ORDER BY person_id"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db)?;
        let rows = stmt
            .query_map([], FaceRow::read)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(FaceRow::into_face).collect()
    }

    /// All attendance records for one day, earliest first.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE date = ?1 ORDER BY time"
        );
        self.query_attendance(&sql, params![date.to_string()])
    }

    /// Most recent records for one person, newest first.
    pub fn history(
        &self,
        person_id: &str,
        limit: u32,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE person_id = ?1
             ORDER BY date DESC, time DESC LIMIT ?2"
        );
        self.query_attendance(&sql, params![person_id, limit])
    }

    pub fn summary(&self, person_id: &str) -> Result<AttendanceSummary, StoreError> {
        let (total, present, late): (u32, u32, u32) = self
            .conn()?
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'present'), 0),
                        COALESCE(SUM(status = 'late'), 0)
                 FROM attendance WHERE person_id = ?1",
                params![person_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(db)?;

        let on_time_percentage = if total > 0 {
            (present as f32 / total as f32 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Ok(AttendanceSummary {
            total,
            present,
            late,
            on_time_percentage,
        })
    }

    fn query_attendance(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt
            .query_map(params, AttendanceRow::read)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        rows.into_iter().map(AttendanceRow::into_record).collect()
    }

    /// Run a statement that yields at most one attendance row.
    fn attendance_row(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = self
            .conn()?
            .query_row(sql, params, AttendanceRow::read)
            .optional()
            .map_err(db)?;
        row.map(AttendanceRow::into_record).transpose()
    }
}

impl Roster for Store {
    fn registered_face(&self, person_id: &str) -> Result<Option<RegisteredFace>, StoreError> {
        let sql = format!(
            "SELECT {FACE_COLUMNS} FROM registered_faces WHERE person_id = ?1"
        );
        let row = self
            .conn()?
            .query_row(&sql, params![person_id], FaceRow::read)
            .optional()
            .map_err(db)?;
        row.map(FaceRow::into_face).transpose()
    }

    fn registered_faces(&self) -> Result<Vec<RegisteredFace>, StoreError> {
        self.list_faces()
    }
}

impl AttendanceLedger for Store {
    fn find(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE person_id = ?1 AND date = ?2"
        );
        self.attendance_row(&sql, params![person_id, date.to_string()])
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let capture_path = record.capture_path.as_deref().map(path_text);
        let result = self.conn()?.execute(
            "INSERT INTO attendance (person_id, date, time, status, confidence, capture_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.person_id,
                record.date.to_string(),
                record.time.to_string(),
                record.status.as_str(),
                record.confidence as f64,
                capture_path,
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(
                    person_id = %record.person_id,
                    date = %record.date,
                    "attendance already committed"
                );
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(db(e)),
        }
    }

    fn remove(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "DELETE FROM attendance WHERE person_id = ?1 AND date = ?2
             RETURNING {ATTENDANCE_COLUMNS}"
        );
        self.attendance_row(&sql, params![person_id, date.to_string()])
    }

    fn set_status(
        &self,
        person_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "UPDATE attendance SET status = ?3 WHERE person_id = ?1 AND date = ?2
             RETURNING {ATTENDANCE_COLUMNS}"
        );
        self.attendance_row(&sql, params![person_id, date.to_string(), status.as_str()])
    }
}
