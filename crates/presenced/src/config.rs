use chrono::NaiveTime;
use presence_core::attendance::default_late_cutoff;
use std::path::PathBuf;

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root for reference images and retained captures.
    pub data_dir: PathBuf,
    /// Directory containing detector and embedder model files.
    pub model_dir: PathBuf,
    /// SeetaFace detector model file name within `model_dir`.
    pub detector_model: String,
    /// ONNX embedding model file name within `model_dir`; region-only mode if absent.
    pub embedder_model: String,
    /// Expected length of embedding vectors.
    pub embedding_dim: usize,
    /// Attendance after this local time is late.
    pub late_cutoff: NaiveTime,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("PRESENCE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("presence")
            });

        let db_path = var("PRESENCE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("presence.db"));

        let model_dir = var("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let late_cutoff = match var("PRESENCE_LATE_CUTOFF") {
            Some(raw) => parse_cutoff(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "invalid PRESENCE_LATE_CUTOFF; using 09:30");
                default_late_cutoff()
            }),
            None => default_late_cutoff(),
        };

        let bus = match var("PRESENCE_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            db_path,
            model_dir,
            detector_model: var("PRESENCE_DETECTOR_MODEL")
                .unwrap_or_else(|| "seeta_fd_frontal_v1.0.bin".to_string()),
            embedder_model: var("PRESENCE_EMBEDDER_MODEL")
                .unwrap_or_else(|| "face_embedding.onnx".to_string()),
            embedding_dim: parse_or(var("PRESENCE_EMBEDDING_DIM"), 128),
            late_cutoff,
            bus,
            data_dir,
        }
    }

    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Where registered reference images are kept.
    pub fn faces_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    /// Where captures of committed attendance are kept.
    pub fn captures_dir(&self) -> PathBuf {
        self.data_dir.join("captures")
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_cutoff(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/kiosk")]);
        let expected = PathBuf::from("/home/kiosk/.local/share/presence");
        assert_eq!(cfg.data_dir, expected);
        assert_eq!(cfg.db_path, cfg.data_dir.join("presence.db"));
        assert_eq!(cfg.model_dir, cfg.data_dir.join("models"));
        assert_eq!(cfg.embedding_dim, 128);
        assert_eq!(cfg.late_cutoff, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(cfg.bus, BusKind::Session);
        assert!(cfg.detector_model_path().ends_with("seeta_fd_frontal_v1.0.bin"));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("PRESENCE_DATA_DIR", "/var/lib/presence"),
            ("PRESENCE_DB_PATH", "/srv/att.db"),
            ("PRESENCE_MODEL_DIR", "/opt/models"),
            ("PRESENCE_EMBEDDER_MODEL", "arc.onnx"),
            ("PRESENCE_EMBEDDING_DIM", "512"),
            ("PRESENCE_LATE_CUTOFF", "08:45"),
            ("PRESENCE_BUS", "system"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/srv/att.db"));
        let captures = PathBuf::from("/var/lib/presence/captures");
        assert_eq!(cfg.captures_dir(), captures);
        assert_eq!(cfg.faces_dir(), PathBuf::from("/var/lib/presence/faces"));
        assert_eq!(cfg.embedder_model_path(), "/opt/models/arc.onnx");
        assert_eq!(cfg.embedding_dim, 512);
        assert_eq!(cfg.late_cutoff, NaiveTime::from_hms_opt(8, 45, 0).unwrap());
        assert_eq!(cfg.bus, BusKind::System);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let cfg = config(&[
            ("HOME", "/h"),
            ("PRESENCE_EMBEDDING_DIM", "lots"),
            ("PRESENCE_LATE_CUTOFF", "half past nine"),
            ("PRESENCE_BUS", "carrier-pigeon"),
        ]);
        assert_eq!(cfg.embedding_dim, 128);
        assert_eq!(cfg.late_cutoff, default_late_cutoff());
        assert_eq!(cfg.bus, BusKind::Session);
    }

    #[test]
    fn test_parse_cutoff_with_seconds() {
        assert_eq!(parse_cutoff("09:15:30"), NaiveTime::from_hms_opt(9, 15, 30));
        assert_eq!(parse_cutoff("25:00"), None);
    }
}
