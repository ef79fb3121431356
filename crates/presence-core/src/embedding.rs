//! Embedding comparator: Euclidean distance between two face embeddings.

use crate::matcher::MatchError;
use crate::types::{ComparisonPath, Embedding, ImageRole, MatchResult};

/// Minimum embedding confidence (percent) to report a match.
pub const EMBEDDING_MATCH_THRESHOLD: f32 = 60.0;

/// Compare two extracted embeddings.
///
/// `confidence = clamp((1 - distance) * 100, 0, 100)`. Either side being
/// `None` (extraction produced nothing) is reported as [`MatchError::NoEmbedding`].
pub fn compare(
    captured: Option<&Embedding>,
    reference: Option<&Embedding>,
) -> Result<MatchResult, MatchError> {
    let captured = captured.ok_or(MatchError::NoEmbedding {
        image: ImageRole::Captured,
    })?;
    let reference = reference.ok_or(MatchError::NoEmbedding {
        image: ImageRole::Reference,
    })?;

    let distance = captured
        .euclidean_distance(reference)
        .ok_or(MatchError::DimensionMismatch {
            captured: captured.dimension(),
            reference: reference.dimension(),
        })?;

    let confidence = ((1.0 - distance) * 100.0).clamp(0.0, 100.0);
    let matched = confidence >= EMBEDDING_MATCH_THRESHOLD;

    tracing::debug!(distance, confidence, matched, "embedding comparison");

    let reason = if matched {
        None
    } else {
        Some(format!("embedding distance {distance:.3} too large"))
    };

    Ok(MatchResult {
        matched,
        confidence,
        distance: Some(distance),
        path: ComparisonPath::Embedding,
        reason,
    })
}
