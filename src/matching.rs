//! Two-stage detection-to-track association.
//!
//! Stage 1 solves an optimal assignment over geometric overlap. Stage 2 runs
//! the same solver over appearance similarity for whatever stage 1 left
//! unmatched, so a geometric match always wins over an appearance match.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::distances::{Affinity, Candidate};
use crate::detection::Detection;
use crate::internal::assignment::linear_sum_assignment;
use crate::track::{Track, TrackId};

/// Cost given to pairs that must never be assigned.
const INVALID_COST: f64 = 1.0e3;

/// Which stage produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Geometric,
    Appearance,
}

/// A detection/track pair accepted by the association engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub detection_idx: usize,
    pub track_id: TrackId,
    /// Overlap or cosine similarity, depending on `kind`.
    pub score: f64,
    pub kind: MatchKind,
}

/// Output of one association pass.
#[derive(Debug, Clone, Default)]
pub struct AssociationResult {
    pub matches: Vec<Match>,
    pub unmatched_detections: Vec<usize>,
    pub unmatched_tracks: Vec<TrackId>,
}

impl AssociationResult {
    /// Detection index -> track id.
    pub fn assignment(&self) -> BTreeMap<usize, TrackId> {
        self.matches
            .iter()
            .map(|m| (m.detection_idx, m.track_id))
            .collect()
    }
}

/// Matches detections to tracks' predicted boxes.
#[derive(Debug, Clone, Copy)]
pub struct Associator {
    pub iou_threshold: f64,
    pub appearance_threshold: f64,
}

impl Associator {
    pub fn new(iou_threshold: f64, appearance_threshold: f64) -> Self {
        Self {
            iou_threshold,
            appearance_threshold,
        }
    }

    /// Associate `detections` with `tracks`.
    ///
    /// Tracks are expected to already carry their predicted state for this tick.
    pub fn associate(&self, detections: &[Detection], tracks: &[&Track]) -> AssociationResult {
        let all_dets: Vec<usize> = (0..detections.len()).collect();
        let all_tracks: Vec<usize> = (0..tracks.len()).collect();

        let (mut matches, dets_left, tracks_left) = self.stage(
            Affinity::Overlap,
            self.iou_threshold,
            MatchKind::Geometric,
            detections,
            tracks,
            &all_dets,
            &all_tracks,
        );

        // Only pairs where both sides carry an embedding can match on appearance.
        let dets_with_emb: Vec<usize> = dets_left
            .iter()
            .copied()
            .filter(|&i| detections[i].embedding.is_some())
            .collect();
        let tracks_with_emb: Vec<usize> = tracks_left
            .iter()
            .copied()
            .filter(|&j| tracks[j].embedding.is_some())
            .collect();

        let (appearance_matches, _, _) = self.stage(
            Affinity::Appearance,
            self.appearance_threshold,
            MatchKind::Appearance,
            detections,
            tracks,
            &dets_with_emb,
            &tracks_with_emb,
        );
        matches.extend(appearance_matches);
        matches.sort_by_key(|m| m.detection_idx);

        let matched_dets: Vec<usize> = matches.iter().map(|m| m.detection_idx).collect();
        let unmatched_detections = get_unmatched(detections.len(), &matched_dets);
        let unmatched_tracks = tracks
            .iter()
            .filter(|t| !matches.iter().any(|m| m.track_id == t.id))
            .map(|t| t.id)
            .collect();

        AssociationResult {
            matches,
            unmatched_detections,
            unmatched_tracks,
        }
    }

    /// One optimal-assignment stage over the given subsets.
    ///
    /// Returns accepted matches plus the detection and track indices left over.
    #[allow(clippy::too_many_arguments)]
    fn stage(
        &self,
        affinity: Affinity,
        threshold: f64,
        kind: MatchKind,
        detections: &[Detection],
        tracks: &[&Track],
        det_indices: &[usize],
        track_indices: &[usize],
    ) -> (Vec<Match>, Vec<usize>, Vec<usize>) {
        if det_indices.is_empty() || track_indices.is_empty() {
            return (Vec::new(), det_indices.to_vec(), track_indices.to_vec());
        }

        let dets: Vec<&Detection> = det_indices.iter().map(|&i| &detections[i]).collect();
        let candidates: Vec<Candidate<'_>> = track_indices
            .iter()
            .map(|&j| Candidate {
                bbox: tracks[j].bbox,
                embedding: tracks[j].embedding.as_deref(),
            })
            .collect();

        let scores = affinity.matrix(&dets, &candidates);
        let cost = scores_to_cost(&scores, threshold);
        let result = linear_sum_assignment(&cost, INVALID_COST / 2.0);

        let mut matches = Vec::with_capacity(result.assignments.len());
        let mut matched_rows = vec![false; det_indices.len()];
        let mut matched_cols = vec![false; track_indices.len()];
        for a in result.assignments {
            let score = scores[(a.row_idx, a.col_idx)];
            if score > threshold {
                matched_rows[a.row_idx] = true;
                matched_cols[a.col_idx] = true;
                matches.push(Match {
                    detection_idx: det_indices[a.row_idx],
                    track_id: tracks[track_indices[a.col_idx]].id,
                    score,
                    kind,
                });
            }
        }

        let dets_left = det_indices
            .iter()
            .zip(matched_rows)
            .filter_map(|(&i, m)| (!m).then_some(i))
            .collect();
        let tracks_left = track_indices
            .iter()
            .zip(matched_cols)
            .filter_map(|(&j, m)| (!m).then_some(j))
            .collect();
        (matches, dets_left, tracks_left)
    }
}

/// `1 - score` where the score clears the threshold, `INVALID_COST` elsewhere.
fn scores_to_cost(scores: &DMatrix<f64>, threshold: f64) -> DMatrix<f64> {
    scores.map(|s| {
        if s.is_finite() && s > threshold {
            1.0 - s
        } else {
            INVALID_COST
        }
    })
}

/// Indices in `0..total` not present in `matched`.
pub fn get_unmatched(total: usize, matched: &[usize]) -> Vec<usize> {
    let mut is_matched = vec![false; total];
    for &idx in matched {
        if idx < total {
            is_matched[idx] = true;
        }
    }
    (0..total).filter(|&i| !is_matched[i]).collect()
}
