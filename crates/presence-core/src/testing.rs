//! Test doubles and synthetic images shared by the unit tests.

use crate::detector::{DetectionParams, DetectorError, FaceDetector};
use crate::recognizer::{EmbedderError, FaceEmbedder};
use crate::store::{Roster, StoreError};
use crate::types::{Embedding, FaceRegion, RegisteredFace};
use image::{GrayImage, Luma};
use std::path::PathBuf;

/// A face-like fixture: bright oval on a dark field with darker "eyes".
/// `shift` moves the oval horizontally.
pub fn face_like(w: u32, h: u32, shift: i32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        let cx = w as f32 / 2.0 + shift as f32;
        let cy = h as f32 / 2.0;
        let dx = (x as f32 - cx) / (w as f32 * 0.35);
        let dy = (y as f32 - cy) / (h as f32 * 0.45);
        let inside = dx * dx + dy * dy <= 1.0;
        let eye = (y as f32 - h as f32 * 0.4).abs() < h as f32 * 0.05
            && ((x as f32 - (cx - w as f32 * 0.12)).abs() < w as f32 * 0.05
                || (x as f32 - (cx + w as f32 * 0.12)).abs() < w as f32 * 0.05);
        let base: u32 = if eye {
            40
        } else if inside {
            200
        } else {
            30
        };
        Luma([(base + (x * 7 + y * 13) % 11) as u8])
    })
}

/// Vertical bars, nothing like a face.
pub fn stripes(w: u32, h: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, _| Luma([if (x / 5) % 2 == 0 { 250 } else { 5 }]))
}

pub fn solid(w: u32, h: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(w, h, Luma([value]))
}

pub fn full_region(image: &GrayImage) -> FaceRegion {
    FaceRegion {
        x: 0,
        y: 0,
        width: image.width(),
        height: image.height(),
        confidence: 1.0,
    }
}

/// "Detects" the whole frame as a face unless the image is a single flat colour.
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect(
        &self,
        image: &GrayImage,
        _params: &DetectionParams,
    ) -> Result<Vec<FaceRegion>, DetectorError> {
        let mut pixels = image.as_raw().iter();
        let first = pixels.next().copied();
        let flat = pixels.all(|&p| Some(p) == first);
        if flat {
            Ok(Vec::new())
        } else {
            Ok(vec![full_region(image)])
        }
    }
}

/// Returns the same embedding (or none) for every face.
pub struct FixedEmbedder(pub Option<Embedding>);

impl FaceEmbedder for FixedEmbedder {
    fn embed(
        &self,
        _image: &GrayImage,
        _region: &FaceRegion,
    ) -> Result<Option<Embedding>, EmbedderError> {
        Ok(self.0.clone())
    }
}

pub struct MemoryRoster(pub Vec<RegisteredFace>);

impl Roster for MemoryRoster {
    fn registered_face(&self, person_id: &str) -> Result<Option<RegisteredFace>, StoreError> {
        Ok(self.0.iter().find(|f| f.person_id == person_id).cloned())
    }

    fn registered_faces(&self) -> Result<Vec<RegisteredFace>, StoreError> {
        Ok(self.0.clone())
    }
}

pub fn with_embedding(person_id: &str, values: &[f32]) -> RegisteredFace {
    RegisteredFace {
        person_id: person_id.to_string(),
        display_name: person_id.to_uppercase(),
        embedding: Some(Embedding::new(values.to_vec())),
        reference_image: None,
    }
}

pub fn with_image(person_id: &str, path: PathBuf) -> RegisteredFace {
    RegisteredFace {
        person_id: person_id.to_string(),
        display_name: person_id.to_uppercase(),
        embedding: None,
        reference_image: Some(path),
    }
}
