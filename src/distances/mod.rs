//! Affinity functions for matching detections to tracks.
//!
//! This module provides:
//! - `Affinity` - enum-dispatched pairwise scoring (higher is better)
//! - Built-in functions (3D/2D overlap, cosine similarity)

mod functions;

pub use functions::*;

use nalgebra::DMatrix;

use crate::detection::{BBox3D, Detection};

/// Pairwise affinity between a detection and a track's predicted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Geometric overlap of bounding boxes.
    Overlap,
    /// Cosine similarity of appearance embeddings.
    Appearance,
}

/// Track-side inputs to an affinity computation.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub bbox: BBox3D,
    pub embedding: Option<&'a [f64]>,
}

impl Affinity {
    /// Score every (detection, candidate) pair.
    ///
    /// Returns an `n_detections x n_candidates` matrix. Pairs that cannot be
    /// scored (e.g. a missing embedding) get `f64::NEG_INFINITY`.
    pub fn matrix(&self, detections: &[&Detection], candidates: &[Candidate<'_>]) -> DMatrix<f64> {
        DMatrix::from_fn(detections.len(), candidates.len(), |i, j| {
            self.score(detections[i], &candidates[j])
        })
    }

    /// Score a single pair.
    pub fn score(&self, detection: &Detection, candidate: &Candidate<'_>) -> f64 {
        match self {
            Affinity::Overlap => overlap(&detection.bbox, &candidate.bbox),
            Affinity::Appearance => match (detection.embedding.as_deref(), candidate.embedding) {
                (Some(a), Some(b)) => cosine_similarity(a, b).unwrap_or(f64::NEG_INFINITY),
                _ => f64::NEG_INFINITY,
            },
        }
    }
}
