//! Storage seams consumed by the engine.
//!
//! Persistence lives outside this crate; the engine only needs to read the
//! roster and to commit attendance with a per-(person, date) uniqueness guarantee.

use crate::attendance::{AttendanceRecord, AttendanceStatus};
use crate::types::RegisteredFace;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt record for {person_id}: {detail}")]
    Corrupt { person_id: String, detail: String },
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Read access to registered faces.
pub trait Roster {
    fn registered_face(&self, person_id: &str) -> Result<Option<RegisteredFace>, StoreError>;

    fn registered_faces(&self) -> Result<Vec<RegisteredFace>, StoreError>;
}

/// Result of attempting to commit an attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record for the same (person, date) was already committed.
    Duplicate,
}

/// Attendance storage. `insert` must be atomic with respect to the
/// (person_id, date) pair: concurrent inserts for the same pair yield exactly
/// one `Inserted`.
pub trait AttendanceLedger {
    fn find(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;

    /// Delete the record for (person_id, date), returning it if there was one.
    fn remove(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Overwrite the status of an existing record and return the updated record.
    fn set_status(
        &self,
        person_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, StoreError>;
}

impl<T: Roster + ?Sized> Roster for &T {
    fn registered_face(&self, person_id: &str) -> Result<Option<RegisteredFace>, StoreError> {
        (**self).registered_face(person_id)
    }

    fn registered_faces(&self) -> Result<Vec<RegisteredFace>, StoreError> {
        (**self).registered_faces()
    }
}

impl<T: AttendanceLedger + ?Sized> AttendanceLedger for &T {
    fn find(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).find(person_id, date)
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        (**self).insert(record)
    }

    fn remove(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).remove(person_id, date)
    }

    fn set_status(
        &self,
        person_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).set_status(person_id, date, status)
    }
}

impl<T: AttendanceLedger + ?Sized> AttendanceLedger for std::sync::Arc<T> {
    fn find(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).find(person_id, date)
    }

    fn insert(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        (**self).insert(record)
    }

    fn remove(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).remove(person_id, date)
    }

    fn set_status(
        &self,
        person_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        (**self).set_status(person_id, date, status)
    }
}
