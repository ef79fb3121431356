use crate::engine::{parse_date, parse_status, EngineError, EngineHandle};
use serde::Serialize;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.presence.Presence1";
pub const OBJECT_PATH: &str = "/org/presence/Presence1";

/// D-Bus interface for the presence attendance daemon.
///
/// Bus name: org.presence.Presence1
/// Object path: /org/presence/Presence1
///
/// Structured replies are JSON strings.
pub struct PresenceService {
    engine: EngineHandle,
}

impl PresenceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    match serde_json::to_string(value) {
        Ok(json) => Ok(json),
        Err(e) => Err(fdo::Error::Failed(format!("serialize reply: {e}"))),
    }
}

fn to_fdo(err: EngineError) -> fdo::Error {
    if err.is_invalid_input() {
        fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "engine request failed");
        fdo::Error::Failed(err.to_string())
    }
}

#[interface(name = "org.presence.Presence1")]
impl PresenceService {
    /// Register (or replace) a person's reference face from encoded image bytes.
    async fn register(&self, user: &str, name: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(user, name, bytes = image.len(), "register requested");
        let registered = self
            .engine
            .register(user.to_string(), name.to_string(), image)
            .await
            .map_err(to_fdo)?;
        to_json(&registered)
    }

    /// Remove a registered person and their attendance history.
    async fn remove(&self, user: &str) -> fdo::Result<bool> {
        tracing::info!(user, "remove requested");
        self.engine.remove(user.to_string()).await.map_err(to_fdo)
    }

    async fn list(&self) -> fdo::Result<String> {
        let roster = self.engine.list().await.map_err(to_fdo)?;
        to_json(&roster)
    }

    /// Verify `image` against `user`'s registration and mark attendance on success.
    async fn verify_and_mark(&self, user: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(user, bytes = image.len(), "verify_and_mark requested");
        let reply = self
            .engine
            .verify_and_mark(user.to_string(), image)
            .await
            .map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Identify `image` against the whole roster and mark attendance on success.
    async fn kiosk_mark(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "kiosk_mark requested");
        let reply = self.engine.kiosk_mark(image).await.map_err(to_fdo)?;
        to_json(&reply)
    }

    /// Withdraw `user`'s attendance for `date` (`YYYY-MM-DD`, empty for today).
    ///
    /// Returns whether a record was removed.
    async fn unmark(&self, user: &str, date: &str) -> fdo::Result<bool> {
        tracing::info!(user, date, "unmark requested");
        let date = parse_date(date).map_err(to_fdo)?;
        let removed = self
            .engine
            .unmark(user.to_string(), date)
            .await
            .map_err(to_fdo)?;
        Ok(removed.is_some())
    }

    /// Set the status (`present` or `late`) of `user`'s record for `date`.
    ///
    /// Replies with the updated record, or `null` when there is none.
    async fn correct(&self, user: &str, date: &str, status: &str) -> fdo::Result<String> {
        tracing::info!(user, date, status, "correct requested");
        let date = parse_date(date).map_err(to_fdo)?;
        let status = parse_status(status).map_err(to_fdo)?;
        let record = self
            .engine
            .correct(user.to_string(), date, status)
            .await
            .map_err(to_fdo)?;
        to_json(&record)
    }

    async fn today(&self) -> fdo::Result<String> {
        let report = self.engine.today().await.map_err(to_fdo)?;
        to_json(&report)
    }

    async fn history(&self, user: &str, limit: u32) -> fdo::Result<String> {
        let history = self
            .engine
            .history(user.to_string(), limit)
            .await
            .map_err(to_fdo)?;
        to_json(&history)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::MatchError;

    #[test]
    fn test_caller_mistakes_map_to_invalid_args() {
        let errors = [
            EngineError::InvalidPersonId("../etc".into()),
            EngineError::InvalidDate("yesterday".into()),
            EngineError::InvalidStatus("absent".into()),
            EngineError::Match(MatchError::UnknownPerson("ghost".into())),
            EngineError::Match(MatchError::NoUsableReference("alice".into())),
        ];
        for err in errors {
            let mapped = to_fdo(err);
            assert!(matches!(mapped, fdo::Error::InvalidArgs(_)), "{mapped:?}");
        }
    }

    #[test]
    fn test_daemon_faults_map_to_failed() {
        let mapped = to_fdo(EngineError::ChannelClosed);
        assert!(matches!(mapped, fdo::Error::Failed(_)));
    }
}
