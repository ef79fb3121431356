//! Face embedding extraction.
//!
//! [`FaceEmbedder::embed`] answers per call whether an embedding is
//! available, so a deployment without a trained model degrades to the
//! region comparator instead of failing.

use crate::types::{Embedding, FaceRegion};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Something that turns a detected face into an embedding.
pub trait FaceEmbedder: Send + Sync {
    /// Extract an embedding for `region` of `image`.
    ///
    /// `Ok(None)` means no trained extractor is available for this call.
    fn embed(
        &self,
        image: &GrayImage,
        region: &FaceRegion,
    ) -> Result<Option<Embedding>, EmbedderError>;
}

/// Embedder for deployments without a trained model.
pub struct NoEmbedder;

impl FaceEmbedder for NoEmbedder {
    fn embed(
        &self,
        _image: &GrayImage,
        _region: &FaceRegion,
    ) -> Result<Option<Embedding>, EmbedderError> {
        Ok(None)
    }
}

/// ONNX face embedding model (ArcFace / FaceNet style: square gray-replicated
/// NCHW input, one embedding vector out).
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    dimension: usize,
    model_version: String,
}

impl OnnxEmbedder {
    /// Load the ONNX model at `model_path`, expecting `dimension`-long output vectors.
    pub fn load(model_path: &str, dimension: usize) -> Result<Self, EmbedderError> {
        let path = Path::new(model_path);
        if !path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            dimension,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        let model_version = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.to_string());

        Ok(Self {
            session: Mutex::new(session),
            dimension,
            model_version,
        })
    }

    /// Crop the face and scale it to the model's square input.
    fn face_crop(image: &GrayImage, region: &FaceRegion) -> GrayImage {
        let (x, y, w, h) = (region.x, region.y, region.width, region.height);
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        imageops::resize(
            &crop,
            EMBEDDER_INPUT_SIZE,
            EMBEDDER_INPUT_SIZE,
            FilterType::Triangle,
        )
    }

    /// Preprocess a square grayscale crop into a NCHW float tensor.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = face.width() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in face.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            let (x, y) = (x as usize, y as usize);
            // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }

        tensor
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(
        &self,
        image: &GrayImage,
        region: &FaceRegion,
    ) -> Result<Option<Embedding>, EmbedderError> {
        let face = Self::face_crop(image, region);
        let input = Self::preprocess(&face);

        let raw: Vec<f32> = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| EmbedderError::InferenceFailed("session lock poisoned".into()))?;
            let inputs = ort::inputs![TensorRef::from_array_view(input.view())?];
            let outputs = session.run(inputs)?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != self.dimension {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                raw.len()
            )));
        }

        Ok(Some(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.model_version.clone()),
        }))
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}
