use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Bounding box of a detected face, clamped to the bounds of its source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector score; only meaningful relative to other regions from the same detector.
    pub confidence: f32,
}

impl FaceRegion {
    /// Build a region from raw detector coordinates, clipping it to a
    /// `bounds_width` × `bounds_height` image.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clipped(
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        confidence: f32,
        bounds_width: u32,
        bounds_height: u32,
    ) -> Option<Self> {
        let x0 = x.clamp(0, bounds_width as i64);
        let y0 = y.clamp(0, bounds_height as i64);
        let x1 = (x + width).clamp(0, bounds_width as i64);
        let y1 = (y + height).clamp(0, bounds_height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
            confidence,
        })
    }
}

/// Face embedding vector produced by a trained extractor (dimensionality is model-defined).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimensionality.
    ///
    /// Returns `None` when the lengths differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }

    /// Serialize as little-endian `f32` bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse little-endian `f32` bytes. Returns `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// A person's registered reference material.
///
/// Either side may be absent: without an embedding the region comparator is
/// used against `reference_image` at compare time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredFace {
    pub person_id: String,
    pub display_name: String,
    pub embedding: Option<Embedding>,
    pub reference_image: Option<PathBuf>,
}

impl RegisteredFace {
    /// Whether the reference image is present on disk.
    pub fn has_reference_image(&self) -> bool {
        self.reference_image.as_deref().is_some_and(|p| p.is_file())
    }
}

/// Which comparison path produced a [`MatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPath {
    Embedding,
    Region,
}

/// Outcome of comparing one captured face against one reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Confidence percentage in [0, 100].
    pub confidence: f32,
    /// Path-specific distance; decreases as confidence increases.
    pub distance: Option<f32>,
    pub path: ComparisonPath,
    pub reason: Option<String>,
}

impl MatchResult {
    /// Distance on a scale shared by both comparison paths (`100 - confidence`).
    ///
    /// Within one path this orders candidates exactly as `distance` does.
    pub fn rank_distance(&self) -> f32 {
        100.0 - self.confidence
    }
}

/// Identifies which of the two compared images a failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Captured,
    Reference,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::Captured => f.write_str("captured"),
            ImageRole::Reference => f.write_str("reference"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, 0.4, 0.5]);
        assert_eq!(a.euclidean_distance(&a), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_embedding_bytes() {
        let a = Embedding::new(vec![1.5, -0.25, 0.0]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_le_bytes(&bytes), Some(a));
        assert_eq!(Embedding::from_le_bytes(&bytes[..5]), None);
    }

    #[test]
    fn test_region_clipped_inside() {
        let r = FaceRegion::clipped(10, 20, 30, 40, 0.9, 100, 100).unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (10, 20, 30, 40));
    }

    #[test]
    fn test_region_clipped_overhanging() {
        let r = FaceRegion::clipped(-10, 90, 30, 40, 0.9, 100, 100).unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (0, 90, 20, 10));
    }

    #[test]
    fn test_region_clipped_outside() {
        assert!(FaceRegion::clipped(120, 0, 30, 30, 0.9, 100, 100).is_none());
        assert!(FaceRegion::clipped(0, 0, 0, 30, 0.9, 100, 100).is_none());
    }

    #[test]
    fn test_rank_distance() {
        let r = MatchResult {
            matched: true,
            confidence: 72.5,
            distance: Some(0.275),
            path: ComparisonPath::Embedding,
            reason: None,
        };
        assert!((r.rank_distance() - 27.5).abs() < 1e-4);
    }
}
