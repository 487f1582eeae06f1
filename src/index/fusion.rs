//! Score fusion for hybrid retrieval.
//!
//! Each channel (dense cosine similarity, sparse keyword rank) is min-max
//! normalized to `[0, 1]` over its own candidate set, then combined as
//! `alpha * dense + (1 - alpha) * sparse`. A candidate missing from one
//! channel contributes zero on that side.

/// Min-max normalizes raw scores. A degenerate range (all scores equal)
/// maps every candidate to 1.0 so one-candidate channels still rank.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; raw.len()];
    }
    raw.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Weighted fusion of the two normalized channels.
pub fn fuse(alpha: f64, dense: Option<f64>, sparse: Option<f64>) -> f64 {
    alpha * dense.unwrap_or(0.0) + (1.0 - alpha) * sparse.unwrap_or(0.0)
}

/// Cosine similarity in `[-1, 1]`; `0.0` for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Encodes an embedding as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
