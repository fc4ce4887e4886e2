//! Vector math behind the drift check: trajectory, ΔS and zones.

use serde::{Deserialize, Serialize};

use crate::types::Zone;

/// Cosine similarity in `[-1, 1]`.
///
/// Zero-magnitude or mismatched vectors have no direction; they score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

/// Semantic tension ΔS = 1 - cos(a, b), clamped to `[0, 2]`.
///
/// 0 = same direction, 1 = orthogonal, 2 = opposite. A zero-magnitude
/// vector gives 1.0: maximally uncertain rather than an error.
pub fn semantic_tension(a: &[f32], b: &[f32]) -> f32 {
    (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
}

/// Elementwise mean of `embeddings`.
///
/// Order-independent, so callers may pass nodes newest-first or oldest-first.
/// `None` for an empty input or vectors of differing length.
pub fn compute_trajectory(embeddings: &[&[f32]]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let dim = first.len();
    if embeddings.iter().any(|e| e.len() != dim) {
        return None;
    }
    let mut sum = vec![0.0_f64; dim];
    for e in embeddings {
        for (acc, x) in sum.iter_mut().zip(e.iter()) {
            *acc += f64::from(*x);
        }
    }
    let n = embeddings.len() as f64;
    Some(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn renormalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Elementwise midpoint of two equally sized vectors.
pub fn midpoint(a: &[f32], b: &[f32]) -> Option<Vec<f32>> {
    compute_trajectory(&[a, b])
}

/// Zone boundaries. Invariant: `0 <= safe < transitional < risk <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub safe: f32,
    pub transitional: f32,
    pub risk: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            safe: 0.4,
            transitional: 0.6,
            risk: 0.85,
        }
    }
}

impl Thresholds {
    pub fn is_valid(&self) -> bool {
        [self.safe, self.transitional, self.risk]
            .iter()
            .all(|t| t.is_finite())
            && 0.0 <= self.safe
            && self.safe < self.transitional
            && self.transitional < self.risk
            && self.risk <= 1.0
    }
}

/// Map ΔS to a zone. Upper bounds are exclusive, so the zones partition the
/// number line with no gaps or overlaps.
pub fn classify_zone(delta_s: f32, thresholds: &Thresholds) -> Zone {
    if delta_s < thresholds.safe {
        Zone::Safe
    } else if delta_s < thresholds.transitional {
        Zone::Transitional
    } else if delta_s < thresholds.risk {
        Zone::Risk
    } else {
        Zone::Danger
    }
}
