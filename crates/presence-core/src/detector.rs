//! Face detection adapter.
//!
//! The engine only relies on [`FaceDetector`]; [`SeetaDetector`] is the
//! bundled implementation using the SeetaFace cascade via `rustface`.

use crate::types::{FaceRegion, ImageRole};
use image::GrayImage;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

const SEETA_PYRAMID_SCALE: f32 = 0.8;
const SEETA_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to load detector model: {0}")]
    ModelLoad(String),
    #[error("no face detected in {image} image")]
    NoFaceDetected { image: ImageRole },
}

/// Tuning for a single detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Smallest face edge, in pixels, the detector will report.
    pub min_face_size: u32,
    /// Minimum detector score for a window to count as a face.
    pub score_threshold: f64,
}

impl DetectionParams {
    /// First attempt: reject small and low-scoring windows.
    pub const PRIMARY: Self = Self {
        min_face_size: 30,
        score_threshold: 2.0,
    };

    /// Retry: smaller faces, lower score bar.
    pub const PERMISSIVE: Self = Self {
        min_face_size: 20,
        score_threshold: 1.0,
    };
}

/// Something that finds face regions in a grayscale image.
pub trait FaceDetector: Send + Sync {
    /// Detect faces, most confident first. Regions are clipped to the image.
    fn detect(
        &self,
        image: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Detect the first face in `image`, retrying once with [`DetectionParams::PERMISSIVE`].
///
/// At most two detector passes are made per call.
pub fn detect_first_face(
    detector: &dyn FaceDetector,
    image: &GrayImage,
    role: ImageRole,
) -> Result<FaceRegion, DetectorError> {
    for params in [DetectionParams::PRIMARY, DetectionParams::PERMISSIVE] {
        let faces = detector.detect(image, &params)?;
        tracing::debug!(
            image = %role,
            found = faces.len(),
            min_face_size = params.min_face_size,
            "detection pass"
        );
        if let Some(face) = faces.into_iter().next() {
            return Ok(face);
        }
    }
    Err(DetectorError::NoFaceDetected { image: role })
}

/// SeetaFace frontal detector.
pub struct SeetaDetector {
    model: rustface::Model,
}

impl SeetaDetector {
    /// Load a SeetaFace model (e.g. `seeta_fd_frontal_v1.0.bin`) from disk.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let file = File::open(model_path)
            .map_err(|e| DetectorError::ModelLoad(format!("{model_path}: {e}")))?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| DetectorError::ModelLoad(format!("{model_path}: {e}")))?;

        tracing::info!(path = model_path, "loaded SeetaFace model");

        Ok(Self { model })
    }
}

impl FaceDetector for SeetaDetector {
    fn detect(
        &self,
        image: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        // The rustface detector is stateful, so each pass gets its own instance.
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(params.min_face_size);
        detector.set_score_thresh(params.score_threshold);
        detector.set_pyramid_scale_factor(SEETA_PYRAMID_SCALE);
        detector.set_slide_window_step(SEETA_WINDOW_STEP, SEETA_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(image.as_raw(), width, height));

        let mut regions: Vec<FaceRegion> = faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                FaceRegion::clipped(
                    bbox.x() as i64,
                    bbox.y() as i64,
                    bbox.width() as i64,
                    bbox.height() as i64,
                    face.score() as f32,
                    width,
                    height,
                )
            })
            .collect();

        sort_by_confidence(&mut regions);
        Ok(regions)
    }
}

fn sort_by_confidence(regions: &mut [FaceRegion]) {
    regions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports a face only when the pass is at least as permissive as `needs`.
    struct ScriptedDetector {
        needs: Option<u32>,
        calls: AtomicUsize,
    }

    impl ScriptedDetector {
        fn new(needs: Option<u32>) -> Self {
            Self {
                needs,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(
            &self,
            image: &GrayImage,
            params: &DetectionParams,
        ) -> Result<Vec<FaceRegion>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.needs {
                Some(min) if params.min_face_size <= min => Ok(vec![FaceRegion {
                    x: 0,
                    y: 0,
                    width: image.width(),
                    height: image.height(),
                    confidence: 1.0,
                }]),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn no_face_role(result: Result<FaceRegion, DetectorError>) -> Option<ImageRole> {
        match result {
            Err(DetectorError::NoFaceDetected { image }) => Some(image),
            _ => None,
        }
    }

    const MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";

    /// The frontal model shipped inside the `rustface` source package.
    fn bundled_model() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os("SEETA_MODEL") {
            return Some(PathBuf::from(path));
        }
        let cargo_home = match std::env::var_os("CARGO_HOME") {
            Some(home) => PathBuf::from(home),
            None => PathBuf::from(std::env::var_os("HOME")?).join(".cargo"),
        };
        let registry = cargo_home.join("registry").join("src");
        let indexes = std::fs::read_dir(registry).ok()?;
        for index in indexes.flatten() {
            let Ok(packages) = std::fs::read_dir(index.path()) else {
                continue;
            };
            for package in packages.flatten() {
                let name = package.file_name();
                if !name.to_string_lossy().starts_with("rustface-") {
                    continue;
                }
                let model = package.path().join("model").join(MODEL_FILE);
                if model.is_file() {
                    return Some(model);
                }
            }
        }
        None
    }

    #[test]
    fn test_primary_pass_hit() {
        let det = ScriptedDetector::new(Some(30));
        let img = GrayImage::new(40, 40);
        let face = detect_first_face(&det, &img, ImageRole::Captured).unwrap();
        assert_eq!(face.width, 40);
        assert_eq!(det.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_permissive_retry_hit() {
        let det = ScriptedDetector::new(Some(20));
        let img = GrayImage::new(40, 40);
        assert!(detect_first_face(&det, &img, ImageRole::Captured).is_ok());
        assert_eq!(det.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_is_bounded() {
        let det = ScriptedDetector::new(None);
        let img = GrayImage::new(40, 40);
        let result = detect_first_face(&det, &img, ImageRole::Reference);
        assert_eq!(no_face_role(result), Some(ImageRole::Reference));
        assert_eq!(det.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_permissive_is_looser() {
        let p = DetectionParams::PRIMARY;
        let q = DetectionParams::PERMISSIVE;
        assert!(q.min_face_size < p.min_face_size);
        assert!(q.score_threshold < p.score_threshold);
    }

    #[test]
    fn test_sort_by_confidence() {
        let mk = |c| FaceRegion {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            confidence: c,
        };
        let mut regions = vec![mk(0.2), mk(0.9), mk(0.5)];
        sort_by_confidence(&mut regions);
        let order: Vec<f32> = regions.iter().map(|r| r.confidence).collect();
        assert_eq!(order, vec![0.9, 0.5, 0.2]);
    }

    #[test]
    fn test_load_missing_model() {
        let result = SeetaDetector::load("/nonexistent/seeta_fd_frontal_v1.0.bin");
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_seeta_solid_images_have_no_face() {
        let Some(model) = bundled_model() else {
            eprintln!("rustface frontal model not found, set SEETA_MODEL to run");
            return;
        };
        let detector = SeetaDetector::load(&model.to_string_lossy()).unwrap();

        for (width, height, value) in [(640, 480, 128u8), (30, 30, 0), (1, 1, 255)] {
            let img = GrayImage::from_pixel(width, height, Luma([value]));
            for params in [DetectionParams::PRIMARY, DetectionParams::PERMISSIVE] {
                let faces = detector.detect(&img, &params).unwrap();
                assert!(faces.is_empty(), "{width}x{height}: {faces:?}");
            }
            let result = detect_first_face(&detector, &img, ImageRole::Captured);
            assert_eq!(no_face_role(result), Some(ImageRole::Captured));
        }
    }

    #[test]
    fn test_seeta_empty_image() {
        let Some(model) = bundled_model() else {
            eprintln!("rustface frontal model not found, set SEETA_MODEL to run");
            return;
        };
        let detector = SeetaDetector::load(&model.to_string_lossy()).unwrap();
        let empty = GrayImage::new(0, 0);
        let faces = detector.detect(&empty, &DetectionParams::PRIMARY).unwrap();
        assert!(faces.is_empty());
    }
}
