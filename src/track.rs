//! Track records maintained by the tracker.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::MotionConfig;
use crate::detection::{BBox3D, Category, Detection, PoseSample};
use crate::filter::MotionFilter;
use crate::utils::clamp_unit;

/// Ticks after which the age and recency quality factors saturate.
pub const QUALITY_SATURATION_TICKS: f64 = 30.0;

/// Stable track identity. Issued monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues track ids.
#[derive(Debug, Default)]
pub struct TrackIdFactory {
    next: u64,
}

impl TrackIdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> TrackId {
        let id = TrackId(self.next);
        self.next += 1;
        id
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// Lifecycle state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Tentative,
    Active,
    Ghost,
    Deleted,
}

impl TrackState {
    pub fn is_live(&self) -> bool {
        !matches!(self, TrackState::Deleted)
    }
}

/// One bounded-history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub tick: u64,
    pub position: Vector3<f64>,
    pub pose: Option<PoseSample>,
}

/// A tracked object.
///
/// Mutated only by the tracking stage; downstream stages read it through a
/// [`TrackSnapshot`].
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub state: TrackState,
    pub category: Category,

    /// Filtered position (m).
    pub position: Vector3<f64>,
    /// Filtered velocity (m/s).
    pub velocity: Vector3<f64>,
    /// Smoothed finite-difference acceleration (m/s^2). Zero until a second
    /// velocity sample exists.
    pub acceleration: Vector3<f64>,
    /// Filtered extents around `position`.
    pub bbox: BBox3D,

    /// Ticks since creation.
    pub age: u32,
    pub time_since_update: u32,
    /// Consecutive matched ticks.
    pub hit_streak: u32,
    pub total_hits: u32,
    /// Whether the track has ever been ACTIVE.
    pub confirmed: bool,

    pub embedding: Option<Vec<f64>>,
    pub quality_score: f64,
    pub match_frequency: f64,
    pub confidence: f64,

    pub history: VecDeque<HistorySample>,
    pub(crate) filter: Box<dyn MotionFilter>,
}

impl Track {
    /// Create a TENTATIVE track from an unmatched detection.
    pub fn new(
        id: TrackId,
        detection: &Detection,
        filter: Box<dyn MotionFilter>,
        tick: u64,
        history_length: usize,
    ) -> Self {
        let mut track = Self {
            id,
            state: TrackState::Tentative,
            category: detection.category,
            position: detection.position(),
            velocity: Vector3::zeros(),
            acceleration: Vector3::zeros(),
            bbox: detection.bbox,
            age: 0,
            time_since_update: 0,
            hit_streak: 1,
            total_hits: 1,
            confirmed: false,
            embedding: detection.embedding.clone(),
            quality_score: 0.0,
            match_frequency: 1.0,
            confidence: clamp_unit(detection.confidence),
            history: VecDeque::with_capacity(history_length),
            filter,
        };
        track.push_history(tick, detection.pose, history_length);
        track.refresh_quality();
        track
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_ghost(&self) -> bool {
        self.state == TrackState::Ghost
    }

    /// Speed in m/s.
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    /// One-sigma position uncertainty from the motion filter.
    pub fn position_uncertainty(&self) -> Vector3<f64> {
        self.filter.position_uncertainty()
    }

    /// Pose samples from the history, oldest first.
    pub fn poses(&self) -> impl Iterator<Item = (u64, &PoseSample)> + '_ {
        self.history
            .iter()
            .filter_map(|s| s.pose.as_ref().map(|p| (s.tick, p)))
    }

    /// Latest pose, if any.
    pub fn latest_pose(&self) -> Option<&PoseSample> {
        self.history.iter().rev().find_map(|s| s.pose.as_ref())
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id,
            category: self.category,
            state: self.state,
            position: self.position,
            velocity: self.velocity,
            quality_score: self.quality_score,
        }
    }

    pub(crate) fn push_history(&mut self, tick: u64, pose: Option<PoseSample>, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistorySample {
            tick,
            position: self.position,
            pose,
        });
    }

    /// Copy kinematics out of the filter and update the acceleration estimate.
    pub(crate) fn refresh_kinematics(&mut self, motion: &MotionConfig) {
        let previous_velocity = self.velocity;
        let velocity = self.filter.velocity();
        let (width, height) = self.filter.extent();

        self.position = self.filter.position();
        self.bbox = BBox3D::new(self.position, width.max(0.0), height.max(0.0), self.bbox.depth);

        if self.age > 0 && motion.tick_interval > 0.0 {
            let raw = (velocity - previous_velocity) / motion.tick_interval;
            let alpha = motion.acceleration_smoothing;
            let mut acceleration = raw * alpha + self.acceleration * (1.0 - alpha);
            let magnitude = acceleration.norm();
            if magnitude > motion.max_acceleration {
                acceleration *= motion.max_acceleration / magnitude;
            }
            if acceleration.iter().all(|v| v.is_finite()) {
                self.acceleration = acceleration;
            } else {
                self.acceleration = Vector3::zeros();
            }
        }
        self.velocity = velocity;
    }

    /// Recompute `match_frequency` and `quality_score`.
    pub(crate) fn refresh_quality(&mut self) {
        self.match_frequency = clamp_unit(self.total_hits as f64 / (self.age as f64 + 1.0));
        self.quality_score = quality_score(
            self.age,
            self.match_frequency,
            self.confidence,
            self.time_since_update,
        );
    }
}

/// Composite track reliability in [0, 1].
///
/// `0.3 * age + 0.3 * match_frequency + 0.2 * confidence + 0.2 * recency`,
/// each factor clamped to [0, 1].
pub fn quality_score(age: u32, match_frequency: f64, confidence: f64, time_since_update: u32) -> f64 {
    let age_factor = clamp_unit(age as f64 / QUALITY_SATURATION_TICKS);
    let recency_factor = clamp_unit(1.0 - time_since_update as f64 / QUALITY_SATURATION_TICKS);
    let score = 0.3 * age_factor
        + 0.3 * clamp_unit(match_frequency)
        + 0.2 * clamp_unit(confidence)
        + 0.2 * recency_factor;
    clamp_unit(score)
}

/// Track fields exposed to representation placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub id: TrackId,
    pub category: Category,
    pub state: TrackState,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub quality_score: f64,
}

/// Immutable view of the live tracks after one tracking step.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    tick: u64,
    tracks: Arc<[Track]>,
}

impl Default for TrackSnapshot {
    fn default() -> Self {
        Self::new(0, Vec::new())
    }
}

impl TrackSnapshot {
    pub fn new(tick: u64, tracks: Vec<Track>) -> Self {
        Self {
            tick,
            tracks: tracks.into(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.tracks.iter().map(Track::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AdaptiveKalmanFilterFactory, MotionFilterFactory};
    use approx::assert_relative_eq;

    fn new_track(id: u64) -> Track {
        let det = Detection::from_center([0.5, 0.9, 15.0], [0.6, 1.8, 0.5], Category::Person(None), 0.8)
            .unwrap();
        let filter = AdaptiveKalmanFilterFactory::new(MotionConfig::default()).create_filter(&det);
        Track::new(TrackId(id), &det, filter, 0, 10)
    }

    #[test]
    fn test_id_factory_is_monotonic() {
        let mut factory = TrackIdFactory::new();
        let a = factory.next_id();
        let b = factory.next_id();
        assert!(b > a);
        assert_eq!(factory.issued(), 2);
        assert_eq!(format!("{}", b), "#1");
    }

    #[test]
    fn test_new_track_is_tentative() {
        let track = new_track(3);
        assert_eq!(track.state, TrackState::Tentative);
        assert_eq!(track.hit_streak, 1);
        assert_eq!(track.history.len(), 1);
        assert_relative_eq!(track.match_frequency, 1.0);
        assert_relative_eq!(track.acceleration.norm(), 0.0);
    }

    #[test]
    fn test_quality_score_weights() {
        // Fresh perfect track: age 0, mf 1, conf 1, recency 1
        assert_relative_eq!(quality_score(0, 1.0, 1.0, 0), 0.7, epsilon = 1e-12);
        // Saturated
        assert_relative_eq!(quality_score(60, 1.0, 1.0, 0), 1.0, epsilon = 1e-12);
        // Stale ghost: recency floored at zero
        assert_relative_eq!(quality_score(30, 0.5, 0.4, 45), 0.3 + 0.15 + 0.08, epsilon = 1e-12);
    }

    #[test]
    fn test_quality_score_clamps_inputs() {
        let q = quality_score(10, 3.0, -2.0, 0);
        assert!((0.0..=1.0).contains(&q));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut track = new_track(0);
        for tick in 1..25 {
            track.push_history(tick, None, 10);
        }
        assert_eq!(track.history.len(), 10);
        assert_eq!(track.history.front().map(|s| s.tick), Some(15));
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = TrackSnapshot::new(4, vec![new_track(1), new_track(2)]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.tick(), 4);
        assert!(snapshot.get(TrackId(2)).is_some());
        assert!(snapshot.get(TrackId(9)).is_none());
        assert_eq!(snapshot.summaries()[0].id, TrackId(1));
    }
}
