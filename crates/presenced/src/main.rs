use anyhow::Result;
use presence_core::recognizer::EmbedderError;
use presence_core::{FaceEmbedder, FaceMatcher, NoEmbedder, OnnxEmbedder, SeetaDetector};
use presence_store::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        data_dir = %config.data_dir.display(),
        late_cutoff = %config.late_cutoff,
        "presenced starting"
    );

    let detector = SeetaDetector::load(&config.detector_model_path())?;

    let embedder_path = config.embedder_model_path();
    let (embedder, embedder_loaded): (Box<dyn FaceEmbedder>, bool) =
        match OnnxEmbedder::load(&embedder_path, config.embedding_dim) {
            Ok(embedder) => (Box::new(embedder), true),
            Err(EmbedderError::ModelNotFound(path)) => {
                tracing::warn!(path, "no embedding model; comparing by face region only");
                (Box::new(NoEmbedder), false)
            }
            Err(err) => return Err(err.into()),
        };

    let store = Arc::new(Store::open(&config.db_path)?);
    let matcher = FaceMatcher::new(Box::new(detector), embedder);
    let engine = engine::Engine::new(&config, matcher, embedder_loaded, store);
    let handle = engine::spawn_engine(engine)?;

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, PresenceService::new(handle))?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
