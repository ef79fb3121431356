//! Attendance resolution: on-time vs. late, at most one record per person per day.

use crate::store::{AttendanceLedger, InsertOutcome, StoreError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("duplicate reported for {person_id} on {date} with no record")]
    MissingDuplicate { person_id: String, date: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl AttendanceStatus {
    /// `Late` strictly after `cutoff`, `Present` otherwise.
    pub fn at(time: NaiveTime, cutoff: NaiveTime) -> Self {
        if time > cutoff {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// A committed attendance entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub person_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
    /// Confidence of the identification that produced this record.
    pub confidence: f32,
    /// Retained capture for the committed attempt, if any.
    pub capture_path: Option<PathBuf>,
}

/// Result of [`AttendanceResolver::mark`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceDecision {
    /// The record in the ledger: freshly inserted, or the one committed earlier today.
    pub record: AttendanceRecord,
    pub already_marked: bool,
}

/// Source of the current local date and time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Default late cutoff: 09:30 local time.
pub fn default_late_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
}

/// Commits attendance after a successful identification.
pub struct AttendanceResolver<L, C = SystemClock> {
    ledger: L,
    clock: C,
    cutoff: NaiveTime,
}

impl<L: AttendanceLedger> AttendanceResolver<L, SystemClock> {
    pub fn new(ledger: L) -> Self {
        Self::with_clock(ledger, SystemClock)
    }
}

impl<L: AttendanceLedger, C: Clock> AttendanceResolver<L, C> {
    pub fn with_clock(ledger: L, clock: C) -> Self {
        Self {
            ledger,
            clock,
            cutoff: default_late_cutoff(),
        }
    }

    pub fn with_cutoff(mut self, cutoff: NaiveTime) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn cutoff(&self) -> NaiveTime {
        self.cutoff
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Current local date and time according to the resolver's clock.
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Today's date according to the resolver's clock.
    pub fn today(&self) -> NaiveDate {
        self.now().date()
    }

    /// Mark `person_id` as attending today.
    ///
    /// A second mark on the same day is an idempotent success: the earlier
    /// record is returned unchanged with `already_marked = true`. Concurrent
    /// marks rely on the ledger's uniqueness guarantee; a lost insert race is
    /// reported the same way.
    pub fn mark(
        &self,
        person_id: &str,
        confidence: f32,
        capture_path: Option<PathBuf>,
    ) -> Result<AttendanceDecision, AttendanceError> {
        let now = self.now();
        let date = now.date();

        if let Some(existing) = self.ledger.find(person_id, date)? {
            tracing::info!(
                person_id,
                %date,
                status = %existing.status,
                "attendance already marked"
            );
            return Ok(AttendanceDecision {
                record: existing,
                already_marked: true,
            });
        }

        let record = AttendanceRecord {
            person_id: person_id.to_string(),
            date,
            time: now.time(),
            status: AttendanceStatus::at(now.time(), self.cutoff),
            confidence,
            capture_path,
        };

        match self.ledger.insert(&record)? {
            InsertOutcome::Inserted => {
                tracing::info!(
                    person_id,
                    %date,
                    status = %record.status,
                    confidence,
                    "attendance marked"
                );
                Ok(AttendanceDecision {
                    record,
                    already_marked: false,
                })
            }
            InsertOutcome::Duplicate => {
                let Some(existing) = self.ledger.find(person_id, date)? else {
                    return Err(AttendanceError::MissingDuplicate {
                        person_id: person_id.to_string(),
                        date,
                    });
                };
                tracing::info!(person_id, %date, "lost insert race; already marked");
                Ok(AttendanceDecision {
                    record: existing,
                    already_marked: true,
                })
            }
        }
    }

    /// Withdraw the record for `person_id` on `date`.
    ///
    /// Returns the removed record, or `None` when there was nothing to remove.
    /// A later mark on the same day commits a fresh record.
    pub fn unmark(
        &self,
        person_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        let removed = self.ledger.remove(person_id, date)?;
        if removed.is_some() {
            tracing::info!(person_id, %date, "attendance withdrawn");
        }
        Ok(removed)
    }

    /// Overwrite the status of the record for `person_id` on `date`.
    ///
    /// Time, confidence and capture are left as committed.
    pub fn correct(
        &self,
        person_id: &str,
        date: NaiveDate,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        let updated = self.ledger.set_status(person_id, date, status)?;
        if updated.is_some() {
            tracing::info!(person_id, %date, %status, "attendance status corrected");
        }
        Ok(updated)
    }
}
