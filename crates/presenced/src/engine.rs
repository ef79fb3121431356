use crate::config::Config;
use chrono::{NaiveDate, NaiveTime};
use image::{DynamicImage, ImageFormat};
use presence_core::attendance::AttendanceError;
use presence_core::{
    AttendanceLedger, AttendanceRecord, AttendanceResolver, AttendanceStatus, Clock, FaceMatcher,
    FaceRegion, Identification, ImageRole, MatchError, MatchResult, RegisteredFace, Roster,
    StoreError, SystemClock, VerifyOutcome,
};
use presence_store::{AttendanceSummary, Store};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid person id: {0:?}")]
    InvalidPersonId(String),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid attendance status {0:?}, expected present or late")]
    InvalidStatus(String),
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("attendance error: {0}")]
    Attendance(#[from] AttendanceError),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Errors caused by the caller's input rather than the daemon.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidPersonId(_)
                | EngineError::InvalidDate(_)
                | EngineError::InvalidStatus(_)
                | EngineError::Decode(_)
                | EngineError::Match(MatchError::UnknownPerson(_))
                | EngineError::Match(MatchError::NoUsableReference(_))
                | EngineError::Match(MatchError::NoFaceDetected { .. })
        )
    }
}

/// Parse a `YYYY-MM-DD` date; an empty string means today.
pub fn parse_date(text: &str) -> Result<Option<NaiveDate>, EngineError> {
    if text.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| EngineError::InvalidDate(text.to_string()))
}

pub fn parse_status(text: &str) -> Result<AttendanceStatus, EngineError> {
    match text.parse::<AttendanceStatus>() {
        Ok(status) => Ok(status),
        Err(_) => Err(EngineError::InvalidStatus(text.to_string())),
    }
}

/// Result of a registration.
#[derive(Debug, Serialize)]
pub struct Registered {
    pub person_id: String,
    pub display_name: String,
    pub embedded: bool,
    pub region: FaceRegion,
}

#[derive(Debug, Serialize)]
pub struct RosterEntry {
    pub person_id: String,
    pub display_name: String,
    pub embedded: bool,
    pub reference_image: Option<PathBuf>,
}

/// Result of an attendance attempt.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkReply {
    Marked {
        person_id: String,
        display_name: String,
        result: MatchResult,
        record: AttendanceRecord,
    },
    AlreadyMarked {
        person_id: String,
        display_name: String,
        result: MatchResult,
        record: AttendanceRecord,
    },
    Rejected {
        result: Option<MatchResult>,
        reason: String,
    },
}

#[derive(Debug, Serialize)]
pub struct TodayReport {
    pub date: NaiveDate,
    pub registered: usize,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    /// Share of registered people marked today, in percent to one decimal.
    pub attendance_percentage: f32,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Serialize)]
pub struct History {
    pub person_id: String,
    pub summary: AttendanceSummary,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub registered: usize,
    pub embedder_loaded: bool,
    pub embedding_dim: usize,
    pub late_cutoff: NaiveTime,
}

/// Owns the matcher, the store and the attendance resolver.
pub struct Engine<C: Clock = SystemClock> {
    matcher: FaceMatcher,
    store: Arc<Store>,
    resolver: AttendanceResolver<Arc<Store>, C>,
    faces_dir: PathBuf,
    captures_dir: PathBuf,
    embedder_loaded: bool,
    embedding_dim: usize,
}

impl Engine<SystemClock> {
    pub fn new(
        config: &Config,
        matcher: FaceMatcher,
        embedder_loaded: bool,
        store: Arc<Store>,
    ) -> Self {
        let resolver = AttendanceResolver::new(Arc::clone(&store));
        Self::from_parts(config, matcher, embedder_loaded, store, resolver)
    }
}

impl<C: Clock> Engine<C> {
    pub fn with_clock(
        config: &Config,
        matcher: FaceMatcher,
        embedder_loaded: bool,
        store: Arc<Store>,
        clock: C,
    ) -> Self {
        let resolver = AttendanceResolver::with_clock(Arc::clone(&store), clock);
        Self::from_parts(config, matcher, embedder_loaded, store, resolver)
    }

    fn from_parts(
        config: &Config,
        matcher: FaceMatcher,
        embedder_loaded: bool,
        store: Arc<Store>,
        resolver: AttendanceResolver<Arc<Store>, C>,
    ) -> Self {
        Self {
            matcher,
            store,
            resolver: resolver.with_cutoff(config.late_cutoff),
            faces_dir: config.faces_dir(),
            captures_dir: config.captures_dir(),
            embedder_loaded,
            embedding_dim: config.embedding_dim,
        }
    }

    /// Register (or re-register) a person from a reference image.
    pub fn register(
        &self,
        person_id: &str,
        display_name: &str,
        image: &[u8],
    ) -> Result<Registered, EngineError> {
        validate_person_id(person_id)?;
        let decoded = decode(image)?;
        let gray = decoded.to_luma8();
        let (region, embedding) = self.matcher.extract(&gray, ImageRole::Reference)?;

        std::fs::create_dir_all(&self.faces_dir)?;
        let reference = self.faces_dir.join(format!("{person_id}.png"));
        decoded.save_with_format(&reference, ImageFormat::Png)?;

        let face = RegisteredFace {
            person_id: person_id.to_string(),
            display_name: display_name.to_string(),
            embedding,
            reference_image: Some(reference),
        };
        self.store.upsert_face(&face)?;

        Ok(Registered {
            person_id: face.person_id,
            display_name: face.display_name,
            embedded: face.embedding.is_some(),
            region,
        })
    }

    /// Remove a person, their attendance and their reference image.
    pub fn remove(&self, person_id: &str) -> Result<bool, EngineError> {
        let Some(face) = self.store.registered_face(person_id)? else {
            return Ok(false);
        };
        let removed = self.store.remove_face(person_id)?;
        if let Some(reference) = face.reference_image {
            discard_file(&reference);
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<RosterEntry>, EngineError> {
        Ok(self
            .store
            .list_faces()?
            .into_iter()
            .map(|face| RosterEntry {
                embedded: face.embedding.is_some(),
                person_id: face.person_id,
                display_name: face.display_name,
                reference_image: face.reference_image,
            })
            .collect())
    }

    /// 1:1 verification of a claimed identity, then attendance.
    pub fn verify_and_mark(
        &self,
        person_id: &str,
        image: &[u8],
    ) -> Result<MarkReply, EngineError> {
        let decoded = decode(image)?;
        let gray = decoded.to_luma8();
        match self.matcher.verify(&*self.store, person_id, gray)? {
            VerifyOutcome::Verified(result) => {
                let display_name = self
                    .store
                    .registered_face(person_id)?
                    .map(|face| face.display_name)
                    .unwrap_or_else(|| person_id.to_string());
                self.commit(person_id.to_string(), display_name, result, &decoded)
            }
            VerifyOutcome::BelowConfidenceFloor(result) => Ok(MarkReply::Rejected {
                reason: format!(
                    "face match confidence ({:.1}%) is below the required threshold",
                    result.confidence
                ),
                result: Some(result),
            }),
            VerifyOutcome::NotMatched(result) => Ok(MarkReply::Rejected {
                reason: result
                    .reason
                    .clone()
                    .unwrap_or_else(|| "face verification failed".to_string()),
                result: Some(result),
            }),
        }
    }

    /// 1:N identification over the roster, then attendance.
    pub fn kiosk_mark(&self, image: &[u8]) -> Result<MarkReply, EngineError> {
        let decoded = decode(image)?;
        match self.matcher.identify(&*self.store, decoded.to_luma8())? {
            Identification::Recognized {
                person_id,
                display_name,
                result,
            } => self.commit(person_id, display_name, result, &decoded),
            Identification::NotRecognized => Ok(MarkReply::Rejected {
                result: None,
                reason: "face not recognized".to_string(),
            }),
        }
    }

    /// Record attendance; the capture is kept on disk only for a newly committed record.
    ///
    /// The capture is written before the record so a stored path always names
    /// an existing file. If the write fails the record is committed without one.
    fn commit(
        &self,
        person_id: String,
        display_name: String,
        result: MatchResult,
        capture: &DynamicImage,
    ) -> Result<MarkReply, EngineError> {
        if let Some(record) = self.store.find(&person_id, self.resolver.today())? {
            tracing::info!(person_id = %person_id, "already marked; capture not retained");
            return Ok(MarkReply::AlreadyMarked {
                person_id,
                display_name,
                result,
                record,
            });
        }

        let stamp = self.resolver.now().format("%Y%m%d_%H%M%S_%3f");
        let capture_path = self.captures_dir.join(format!("{person_id}_{stamp}.png"));
        let saved = match save_capture(capture, &capture_path) {
            Ok(()) => Some(capture_path),
            Err(err) => {
                tracing::warn!(
                    path = %capture_path.display(),
                    error = %err,
                    "failed to retain capture; recording attendance without it"
                );
                None
            }
        };

        let confidence = result.confidence;
        let decision = match self.resolver.mark(&person_id, confidence, saved.clone()) {
            Ok(decision) => decision,
            Err(err) => {
                if let Some(path) = &saved {
                    discard_file(path);
                }
                return Err(err.into());
            }
        };

        if decision.already_marked {
            let committed = decision.record.capture_path.as_ref();
            if let Some(path) = saved.as_ref().filter(|&p| Some(p) != committed) {
                discard_file(path);
            }
            return Ok(MarkReply::AlreadyMarked {
                person_id,
                display_name,
                result,
                record: decision.record,
            });
        }

        Ok(MarkReply::Marked {
            person_id,
            display_name,
            result,
            record: decision.record,
        })
    }

    /// Withdraw a person's attendance for `date` (today when `None`).
    ///
    /// The record's retained capture is deleted with it. A later attempt on the
    /// same day commits a fresh record.
    pub fn unmark(
        &self,
        person_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Option<AttendanceRecord>, EngineError> {
        let date = date.unwrap_or_else(|| self.resolver.today());
        let removed = self.resolver.unmark(person_id, date)?;
        if let Some(capture) = removed.as_ref().and_then(|r| r.capture_path.as_deref()) {
            discard_file(capture);
        }
        Ok(removed)
    }

    /// Change the status of a person's record for `date` (today when `None`).
    pub fn correct(
        &self,
        person_id: &str,
        date: Option<NaiveDate>,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, EngineError> {
        let date = date.unwrap_or_else(|| self.resolver.today());
        Ok(self.resolver.correct(person_id, date, status)?)
    }

    pub fn today(&self) -> Result<TodayReport, EngineError> {
        let date = self.resolver.today();
        let records = self.store.attendance_on(date)?;
        let registered = self.store.list_faces()?.len();

        let late = records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Late)
            .count();
        let present = records.len() - late;
        let attendance_percentage = if registered > 0 {
            (records.len() as f32 / registered as f32 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Ok(TodayReport {
            date,
            registered,
            present,
            late,
            absent: registered.saturating_sub(records.len()),
            attendance_percentage,
            records,
        })
    }

    pub fn history(&self, person_id: &str, limit: u32) -> Result<History, EngineError> {
        Ok(History {
            person_id: person_id.to_string(),
            summary: self.store.summary(person_id)?,
            records: self.store.history(person_id, limit)?,
        })
    }

    pub fn status(&self) -> Result<Status, EngineError> {
        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            registered: self.store.list_faces()?.len(),
            embedder_loaded: self.embedder_loaded,
            embedding_dim: self.embedding_dim,
            late_cutoff: self.resolver.cutoff(),
        })
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, EngineError> {
    image::load_from_memory(bytes).map_err(EngineError::Decode)
}

/// Person ids become file names, so keep them to a conservative character set.
fn validate_person_id(person_id: &str) -> Result<(), EngineError> {
    let valid = !person_id.is_empty()
        && person_id.len() <= 64
        && !person_id.starts_with('.')
        && person_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidPersonId(person_id.to_string()))
    }
}

fn save_capture(capture: &DynamicImage, path: &Path) -> Result<(), EngineError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    capture.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

fn discard_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove file")
        }
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        person_id: String,
        display_name: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Registered, EngineError>>,
    },
    Remove {
        person_id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<RosterEntry>, EngineError>>,
    },
    VerifyAndMark {
        person_id: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MarkReply, EngineError>>,
    },
    KioskMark {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MarkReply, EngineError>>,
    },
    Unmark {
        person_id: String,
        date: Option<NaiveDate>,
        reply: oneshot::Sender<Result<Option<AttendanceRecord>, EngineError>>,
    },
    Correct {
        person_id: String,
        date: Option<NaiveDate>,
        status: AttendanceStatus,
        reply: oneshot::Sender<Result<Option<AttendanceRecord>, EngineError>>,
    },
    Today {
        reply: oneshot::Sender<Result<TodayReport, EngineError>>,
    },
    History {
        person_id: String,
        limit: u32,
        reply: oneshot::Sender<Result<History, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<Status, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn register(
        &self,
        person_id: String,
        display_name: String,
        image: Vec<u8>,
    ) -> Result<Registered, EngineError> {
        self.request(|reply| EngineRequest::Register {
            person_id,
            display_name,
            image,
            reply,
        })
        .await
    }

    pub async fn remove(&self, person_id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Remove { person_id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<RosterEntry>, EngineError> {
        self.request(|reply| EngineRequest::List { reply }).await
    }

    pub async fn verify_and_mark(
        &self,
        person_id: String,
        image: Vec<u8>,
    ) -> Result<MarkReply, EngineError> {
        self.request(|reply| EngineRequest::VerifyAndMark {
            person_id,
            image,
            reply,
        })
        .await
    }

    pub async fn kiosk_mark(&self, image: Vec<u8>) -> Result<MarkReply, EngineError> {
        self.request(|reply| EngineRequest::KioskMark { image, reply }).await
    }

    pub async fn unmark(
        &self,
        person_id: String,
        date: Option<NaiveDate>,
    ) -> Result<Option<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::Unmark {
            person_id,
            date,
            reply,
        })
        .await
    }

    pub async fn correct(
        &self,
        person_id: String,
        date: Option<NaiveDate>,
        status: AttendanceStatus,
    ) -> Result<Option<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::Correct {
            person_id,
            date,
            status,
            reply,
        })
        .await
    }

    pub async fn today(&self) -> Result<TodayReport, EngineError> {
        self.request(|reply| EngineRequest::Today { reply }).await
    }

    pub async fn history(&self, person_id: String, limit: u32) -> Result<History, EngineError> {
        self.request(|reply| EngineRequest::History {
            person_id,
            limit,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread and return a handle to it.
pub fn spawn_engine<C: Clock + 'static>(engine: Engine<C>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&engine, req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn handle_request<C: Clock>(engine: &Engine<C>, req: EngineRequest) {
    match req {
        EngineRequest::Register {
            person_id,
            display_name,
            image,
            reply,
        } => {
            let _ = reply.send(engine.register(&person_id, &display_name, &image));
        }
        EngineRequest::Remove { person_id, reply } => {
            let _ = reply.send(engine.remove(&person_id));
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(engine.list());
        }
        EngineRequest::VerifyAndMark {
            person_id,
            image,
            reply,
        } => {
            let _ = reply.send(engine.verify_and_mark(&person_id, &image));
        }
        EngineRequest::KioskMark { image, reply } => {
            let _ = reply.send(engine.kiosk_mark(&image));
        }
        EngineRequest::Unmark {
            person_id,
            date,
            reply,
        } => {
            let _ = reply.send(engine.unmark(&person_id, date));
        }
        EngineRequest::Correct {
            person_id,
            date,
            status,
            reply,
        } => {
            let _ = reply.send(engine.correct(&person_id, date, status));
        }
        EngineRequest::Today { reply } => {
            let _ = reply.send(engine.today());
        }
        EngineRequest::History {
            person_id,
            limit,
            reply,
        } => {
            let _ = reply.send(engine.history(&person_id, limit));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(engine.status());
        }
    }
}
