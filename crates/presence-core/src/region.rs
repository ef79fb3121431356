//! Region comparator: scores two detected faces with image-level metrics.
//!
//! Used when no embedding is available for both sides. Both faces are cropped,
//! scaled to a canonical square and histogram-equalized, then scored by
//! histogram correlation, a zero-offset template coefficient and a
//! mean-subtracted normalized cross-correlation.

use crate::types::{ComparisonPath, FaceRegion, MatchResult};
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use imageproc::stats::histogram;

/// Edge length every face is resampled to before scoring.
pub const CANONICAL_FACE_SIZE: u32 = 150;

/// Minimum region confidence (percent) for the region path to report a match.
pub const REGION_MATCH_THRESHOLD: f32 = 40.0;

const HISTOGRAM_WEIGHT: f64 = 0.3;
const TEMPLATE_WEIGHT: f64 = 0.3;
const NCC_WEIGHT: f64 = 0.4;

const REJECT_REASON: &str = "face does not match with sufficient confidence";

/// Individual similarity metrics for one pair of faces, each roughly in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionScores {
    pub histogram: f64,
    pub template: f64,
    pub ncc: f64,
}

impl RegionScores {
    /// Weighted combination with negative metrics floored at zero.
    pub fn combined(&self) -> f64 {
        HISTOGRAM_WEIGHT * self.histogram.max(0.0)
            + TEMPLATE_WEIGHT * self.template.max(0.0)
            + NCC_WEIGHT * self.ncc.max(0.0)
    }
}

/// Crop `region` out of `image`, resample to the canonical size and equalize.
pub fn normalize_face(image: &GrayImage, region: &FaceRegion) -> GrayImage {
    let (x, y, w, h) = (region.x, region.y, region.width, region.height);
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    let resized = imageops::resize(
        &crop,
        CANONICAL_FACE_SIZE,
        CANONICAL_FACE_SIZE,
        FilterType::Triangle,
    );
    equalize_histogram(&resized)
}

/// Score two normalized faces of identical dimensions.
pub fn score_faces(a: &GrayImage, b: &GrayImage) -> RegionScores {
    RegionScores {
        histogram: histogram_correlation(a, b),
        template: template_coefficient(a, b),
        ncc: normalized_cross_correlation(a, b),
    }
}

/// Compare the face at `region_a` in `a` with the face at `region_b` in `b`.
///
/// Pure and symmetric in its two (image, region) arguments.
pub fn compare(
    a: &GrayImage,
    region_a: &FaceRegion,
    b: &GrayImage,
    region_b: &FaceRegion,
) -> MatchResult {
    let face_a = normalize_face(a, region_a);
    let face_b = normalize_face(b, region_b);
    let scores = score_faces(&face_a, &face_b);
    let combined = scores.combined();

    let confidence = (combined * 100.0).clamp(0.0, 100.0) as f32;
    let matched = confidence >= REGION_MATCH_THRESHOLD;

    tracing::debug!(
        histogram = scores.histogram,
        template = scores.template,
        ncc = scores.ncc,
        confidence,
        matched,
        "region comparison"
    );

    MatchResult {
        matched,
        confidence,
        distance: Some(100.0 - confidence),
        path: ComparisonPath::Region,
        reason: (!matched).then(|| REJECT_REASON.to_string()),
    }
}

/// Correlation of the two 256-bin intensity histograms, each min-max normalized.
///
/// Two flat histograms correlate perfectly.
fn histogram_correlation(a: &GrayImage, b: &GrayImage) -> f64 {
    let ha = normalized_histogram(a);
    let hb = normalized_histogram(b);
    pearson(&ha, &hb).unwrap_or(1.0)
}

fn normalized_histogram(image: &GrayImage) -> [f64; 256] {
    let counts = histogram(image).channels[0];
    let min = counts.iter().copied().min().unwrap_or(0) as f64;
    let max = counts.iter().copied().max().unwrap_or(0) as f64;
    let range = max - min;

    let mut out = [0.0f64; 256];
    if range > 0.0 {
        for (o, &c) in out.iter_mut().zip(counts.iter()) {
            *o = (c as f64 - min) / range;
        }
    }
    out
}

/// Correlation coefficient of one face slid over the other at zero offset.
///
/// Zero when either face has no variance.
fn template_coefficient(a: &GrayImage, b: &GrayImage) -> f64 {
    pixel_correlation(a, b).unwrap_or(0.0)
}

/// Mean-subtracted normalized cross-correlation over pixel intensities.
///
/// Scaling intensities to [0, 1] leaves the coefficient unchanged, so it is
/// computed on the raw 8-bit values. Zero when either face has no variance.
fn normalized_cross_correlation(a: &GrayImage, b: &GrayImage) -> f64 {
    pixel_correlation(a, b).unwrap_or(0.0)
}

/// Pearson coefficient of two equally sized 8-bit images from exact integer
/// sums; `None` when either image is flat.
fn pixel_correlation(a: &GrayImage, b: &GrayImage) -> Option<f64> {
    let (a, b) = (a.as_raw(), b.as_raw());
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let n = a.len() as i128;
    let (mut sum_a, mut sum_b) = (0i128, 0i128);
    let (mut sum_aa, mut sum_bb, mut sum_ab) = (0i128, 0i128, 0i128);
    for (&pa, &pb) in a.iter().zip(b.iter()) {
        let (pa, pb) = (pa as i128, pb as i128);
        sum_a += pa;
        sum_b += pb;
        sum_aa += pa * pa;
        sum_bb += pb * pb;
        sum_ab += pa * pb;
    }

    let covariance = n * sum_ab - sum_a * sum_b;
    let var_a = n * sum_aa - sum_a * sum_a;
    let var_b = n * sum_bb - sum_b * sum_b;
    if var_a == 0 || var_b == 0 {
        return None;
    }

    Some(covariance as f64 / ((var_a as f64) * (var_b as f64)).sqrt())
}

/// Pearson correlation of two equally long sequences; `None` on zero variance.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        numerator += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }

    let denominator = (var_a * var_b).sqrt();
    (denominator > f64::EPSILON).then(|| numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_like, full_region as full, solid, stripes};
    use image::Luma;

    #[test]
    fn test_normalize_face_canonical_size() {
        let img = face_like(320, 240, 0);
        let region = FaceRegion {
            x: 60,
            y: 20,
            width: 200,
            height: 200,
            confidence: 1.0,
        };
        let face = normalize_face(&img, &region);
        assert_eq!(
            face.dimensions(),
            (CANONICAL_FACE_SIZE, CANONICAL_FACE_SIZE)
        );
    }

    #[test]
    fn test_identical_faces_match() {
        let img = face_like(200, 200, 0);
        let result = compare(&img, &full(&img), &img, &full(&img));
        assert!(result.matched);
        assert!(result.confidence > 99.0, "{}", result.confidence);
        assert_eq!(result.path, ComparisonPath::Region);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_different_content_rejected() {
        let a = face_like(200, 200, 0);
        let b = stripes(200, 200);
        let result = compare(&a, &full(&a), &b, &full(&b));
        assert!(!result.matched, "confidence = {}", result.confidence);
        assert!(result.reason.is_some());
    }

    #[test]
    fn test_compare_is_symmetric() {
        let a = face_like(200, 220, 0);
        let b = face_like(180, 200, 6);
        let na = normalize_face(&a, &full(&a));
        let nb = normalize_face(&b, &full(&b));
        assert_eq!(
            score_faces(&na, &nb).combined(),
            score_faces(&nb, &na).combined()
        );
        assert_eq!(
            compare(&a, &full(&a), &b, &full(&b)),
            compare(&b, &full(&b), &a, &full(&a))
        );
    }

    #[test]
    fn test_distance_complements_confidence() {
        let a = face_like(200, 200, 0);
        let b = face_like(200, 200, 10);
        let r = compare(&a, &full(&a), &b, &full(&b));
        let d = r.distance.unwrap();
        assert!((d + r.confidence - 100.0).abs() < 1e-4);
        assert!((0.0..=100.0).contains(&r.confidence));
    }

    #[test]
    fn test_combined_floors_negative_metrics() {
        let scores = RegionScores {
            histogram: -0.5,
            template: -0.2,
            ncc: 1.0,
        };
        assert!((scores.combined() - 0.4).abs() < 1e-12);
        let all = RegionScores {
            histogram: 1.0,
            template: 1.0,
            ncc: 1.0,
        };
        assert!((all.combined() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_ncc_zero_variance() {
        let flat = GrayImage::from_pixel(10, 10, Luma([90]));
        let other = stripes(10, 10);
        assert_eq!(normalized_cross_correlation(&flat, &other), 0.0);
        assert_eq!(normalized_cross_correlation(&other, &flat), 0.0);
    }

    #[test]
    fn test_ncc_zero_variance_canonical_size() {
        let img = face_like(200, 200, 0);
        let face = normalize_face(&img, &full(&img));
        for value in [0u8, 37, 90, 128, 201, 255] {
            let flat = solid(CANONICAL_FACE_SIZE, CANONICAL_FACE_SIZE, value);
            assert_eq!(normalized_cross_correlation(&flat, &face), 0.0);
            assert_eq!(normalized_cross_correlation(&face, &flat), 0.0);
            assert_eq!(template_coefficient(&face, &flat), 0.0);
            assert_eq!(normalized_cross_correlation(&flat, &flat), 0.0);
        }
    }

    #[test]
    fn test_ncc_inverted_is_negative() {
        let a = stripes(20, 20);
        let b = GrayImage::from_fn(20, 20, |x, y| Luma([255 - a.get_pixel(x, y).0[0]]));
        assert!((normalized_cross_correlation(&a, &b) + 1.0).abs() < 1e-9);
        assert!((template_coefficient(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ncc_identical_is_one() {
        let a = face_like(64, 64, 0);
        assert!((normalized_cross_correlation(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_histogram_correlation_identical() {
        let a = face_like(64, 64, 0);
        assert!((histogram_correlation(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_degenerate() {
        assert_eq!(pearson(&[1.0, 1.0], &[0.0, 2.0]), None);
        assert_eq!(pearson(&[], &[]), None);
    }
}
