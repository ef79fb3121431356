//! presence-core: Face match decision engine for attendance.
//!
//! Compares a captured face against registered references, either by
//! embedding distance or, when no embedding is available, by image-level
//! region metrics. Supports 1:1 verification, 1:N kiosk identification and
//! once-per-day attendance resolution.

pub mod attendance;
pub mod detector;
pub mod embedding;
pub mod matcher;
pub mod recognizer;
pub mod region;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{
    AttendanceDecision, AttendanceRecord, AttendanceResolver, AttendanceStatus, Clock, SystemClock,
};
pub use detector::{DetectionParams, FaceDetector, SeetaDetector};
pub use matcher::{FaceMatcher, Identification, MatchError, Probe, VerifyOutcome};
pub use recognizer::{FaceEmbedder, NoEmbedder, OnnxEmbedder};
pub use store::{AttendanceLedger, InsertOutcome, Roster, StoreError};
pub use types::{ComparisonPath, Embedding, FaceRegion, ImageRole, MatchResult, RegisteredFace};
