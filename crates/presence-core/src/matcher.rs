//! Match decision and identification.
//!
//! [`FaceMatcher`] prepares a captured image once, then compares it against
//! registered faces using the embedding path when both sides have an
//! embedding and the region path otherwise. The two paths are never mixed
//! within one comparison.

use crate::detector::{detect_first_face, DetectorError, FaceDetector};
use crate::embedding;
use crate::recognizer::{EmbedderError, FaceEmbedder};
use crate::region;
use crate::store::{Roster, StoreError};
use crate::types::{Embedding, FaceRegion, ImageRole, MatchResult, RegisteredFace};
use image::GrayImage;
use rayon::prelude::*;
use thiserror::Error;

/// Minimum confidence for a 1:1 verification to succeed, on top of the path's own threshold.
pub const VERIFY_CONFIDENCE_FLOOR: f32 = 50.0;

/// Minimum confidence for a roster entry to be considered during 1:N identification.
pub const IDENTIFY_CONFIDENCE_FLOOR: f32 = 30.0;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no face detected in {image} image")]
    NoFaceDetected { image: ImageRole },
    #[error("embedding dimension mismatch: captured {captured}, stored {reference}")]
    DimensionMismatch { captured: usize, reference: usize },
    #[error("no embedding extracted from {image} image")]
    NoEmbedding { image: ImageRole },
    #[error("person not registered: {0}")]
    UnknownPerson(String),
    #[error("no usable reference registered for {0}")]
    NoUsableReference(String),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<DetectorError> for MatchError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::NoFaceDetected { image } => MatchError::NoFaceDetected { image },
            other => MatchError::Detector(other),
        }
    }
}

impl MatchError {
    /// Failures attributable to one roster entry's reference material.
    fn is_reference_fault(&self) -> bool {
        match self {
            MatchError::NoFaceDetected { image } => *image == ImageRole::Reference,
            MatchError::NoUsableReference(_) | MatchError::Image(_) => true,
            _ => false,
        }
    }
}

/// A captured image after detection and (optional) embedding extraction.
#[derive(Debug, Clone)]
pub struct Probe {
    pub image: GrayImage,
    pub region: FaceRegion,
    pub embedding: Option<Embedding>,
}

/// Outcome of a 1:1 verification.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Verified(MatchResult),
    /// The comparator matched, but below [`VERIFY_CONFIDENCE_FLOOR`].
    BelowConfidenceFloor(MatchResult),
    NotMatched(MatchResult),
}

impl VerifyOutcome {
    pub fn from_result(result: MatchResult) -> Self {
        if !result.matched {
            VerifyOutcome::NotMatched(result)
        } else if result.confidence < VERIFY_CONFIDENCE_FLOOR {
            VerifyOutcome::BelowConfidenceFloor(result)
        } else {
            VerifyOutcome::Verified(result)
        }
    }

    pub fn result(&self) -> &MatchResult {
        match self {
            VerifyOutcome::Verified(r)
            | VerifyOutcome::BelowConfidenceFloor(r)
            | VerifyOutcome::NotMatched(r) => r,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified(_))
    }
}

/// Outcome of a 1:N identification.
#[derive(Debug, Clone, PartialEq)]
pub enum Identification {
    Recognized {
        person_id: String,
        display_name: String,
        result: MatchResult,
    },
    NotRecognized,
}

/// Face match decision engine.
pub struct FaceMatcher {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

impl FaceMatcher {
    pub fn new(detector: Box<dyn FaceDetector>, embedder: Box<dyn FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }

    /// Detect the first face in a captured image and extract its embedding if possible.
    pub fn prepare_probe(&self, image: GrayImage) -> Result<Probe, MatchError> {
        let region = detect_first_face(self.detector.as_ref(), &image, ImageRole::Captured)?;
        let embedding = self.embedder.embed(&image, &region)?;
        tracing::debug!(
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            embedded = embedding.is_some(),
            "probe prepared"
        );
        Ok(Probe {
            image,
            region,
            embedding,
        })
    }

    /// Detect the first face in an image and extract its embedding if possible.
    ///
    /// Used when registering reference material.
    pub fn extract(
        &self,
        image: &GrayImage,
        role: ImageRole,
    ) -> Result<(FaceRegion, Option<Embedding>), MatchError> {
        let region = detect_first_face(self.detector.as_ref(), image, role)?;
        let embedding = self.embedder.embed(image, &region)?;
        Ok((region, embedding))
    }

    /// Whether `face` can be compared with `probe` at all.
    pub fn is_comparable(probe: &Probe, face: &RegisteredFace) -> bool {
        (probe.embedding.is_some() && face.embedding.is_some()) || face.has_reference_image()
    }

    /// Compare a prepared probe with one registered face.
    ///
    /// Uses embeddings when both sides have one; otherwise falls back to the
    /// region comparator on the two source images.
    pub fn compare(&self, probe: &Probe, face: &RegisteredFace) -> Result<MatchResult, MatchError> {
        if probe.embedding.is_some() && face.embedding.is_some() {
            return embedding::compare(probe.embedding.as_ref(), face.embedding.as_ref());
        }

        let path = face
            .reference_image
            .as_deref()
            .filter(|p| p.is_file())
            .ok_or_else(|| MatchError::NoUsableReference(face.person_id.clone()))?;

        let reference = image::open(path)?.to_luma8();
        let detector = self.detector.as_ref();
        let reference_region = detect_first_face(detector, &reference, ImageRole::Reference)?;

        Ok(region::compare(&reference, &reference_region, &probe.image, &probe.region))
    }

    /// 1:1 verification of a claimed identity.
    pub fn verify<R: Roster + ?Sized>(
        &self,
        roster: &R,
        person_id: &str,
        image: GrayImage,
    ) -> Result<VerifyOutcome, MatchError> {
        let face = roster
            .registered_face(person_id)?
            .ok_or_else(|| MatchError::UnknownPerson(person_id.to_string()))?;

        let probe = self.prepare_probe(image)?;
        let outcome = VerifyOutcome::from_result(self.compare(&probe, &face)?);

        let result = outcome.result();
        tracing::info!(
            person_id,
            confidence = result.confidence,
            path = ?result.path,
            verified = outcome.is_verified(),
            "verification complete"
        );

        Ok(outcome)
    }

    /// 1:N identification over the whole roster.
    ///
    /// Candidates are evaluated in parallel; the winner is the passing
    /// candidate with the lowest distance, ties going to the earlier roster entry.
    pub fn identify<R: Roster + ?Sized>(
        &self,
        roster: &R,
        image: GrayImage,
    ) -> Result<Identification, MatchError> {
        let faces = roster.registered_faces()?;
        if faces.is_empty() {
            tracing::info!("identification skipped: roster is empty");
            return Ok(Identification::NotRecognized);
        }

        let probe = self.prepare_probe(image)?;

        let evaluated = faces
            .par_iter()
            .enumerate()
            .filter(|(_, face)| {
                let usable = Self::is_comparable(&probe, face);
                if !usable {
                    tracing::debug!(
                        person_id = %face.person_id,
                        "skipping entry without usable reference"
                    );
                }
                usable
            })
            .map(|(idx, face)| match self.compare(&probe, face) {
                Ok(result) => Ok(Some((idx, result))),
                Err(err) if err.is_reference_fault() => {
                    tracing::warn!(
                        person_id = %face.person_id,
                        error = %err,
                        "skipping roster entry"
                    );
                    Ok(None)
                }
                Err(err) => Err(err),
            })
            .collect::<Result<Vec<_>, MatchError>>()?;

        let best = evaluated
            .into_iter()
            .flatten()
            .filter(|(_, r)| r.matched && r.confidence >= IDENTIFY_CONFIDENCE_FLOOR)
            .min_by(|(ia, a), (ib, b)| {
                a.rank_distance()
                    .total_cmp(&b.rank_distance())
                    .then(ia.cmp(ib))
            });

        let Some((idx, result)) = best else {
            tracing::info!(
                roster = faces.len(),
                "no candidate above identification floor"
            );
            return Ok(Identification::NotRecognized);
        };

        let face = &faces[idx];
        tracing::info!(
            person_id = %face.person_id,
            confidence = result.confidence,
            distance = ?result.distance,
            path = ?result.path,
            "identified"
        );

        Ok(Identification::Recognized {
            person_id: face.person_id.clone(),
            display_name: face.display_name.clone(),
            result,
        })
    }
}
