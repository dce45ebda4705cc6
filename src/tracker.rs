//! Per-tick tracking stage.

use tracing::{debug, info, warn};

use crate::appearance::AppearanceUpdater;
use crate::config::{MotionConfig, TrackingConfig};
use crate::detection::{Category, Detection};
use crate::filter::{
    measurement_from, AdaptiveKalmanFilterFactory, FilterHealth, MotionFilterFactory,
};
use crate::matching::{AssociationResult, Associator};
use crate::store::TrackStore;
use crate::track::{Track, TrackId, TrackIdFactory, TrackSnapshot, TrackState};
use crate::{Error, Result};

/// Everything the tracking stage produced for one tick.
#[derive(Debug, Clone, Default)]
pub struct TickTracking {
    pub tick: u64,
    /// Live tracks after this tick.
    pub snapshot: TrackSnapshot,
    /// Detection/track assignment with matched and unmatched sets.
    pub association: AssociationResult,
    pub created: Vec<TrackId>,
    /// Tracks confirmed (first promotion to ACTIVE) this tick.
    pub promoted: Vec<(TrackId, Category)>,
    pub deleted: Vec<TrackId>,
    pub evicted: Vec<TrackId>,
    /// Detections dropped as invalid or above the per-frame cap.
    pub rejected_detections: usize,
    /// Filters reset from a degenerate covariance.
    pub filter_resets: usize,
    /// No detection batch was available this tick.
    pub missing_input: bool,
}

/// Object tracker.
///
/// Owns the [`TrackStore`] and is its only writer.
pub struct Tracker {
    config: TrackingConfig,
    motion: MotionConfig,
    store: TrackStore,
    ids: TrackIdFactory,
    filter_factory: Box<dyn MotionFilterFactory>,
    associator: Associator,
    appearance: AppearanceUpdater,
}

impl Tracker {
    /// Create a tracker using the adaptive Kalman filter.
    ///
    /// # Arguments
    /// * `config` - Association thresholds, lifecycle counters and store capacity
    /// * `motion` - Filter noise settings and tick interval
    ///
    /// # Returns
    /// An empty tracker.
    ///
    /// # Errors
    /// `InvalidConfig` if either configuration section is invalid.
    pub fn new(config: TrackingConfig, motion: MotionConfig) -> Result<Self> {
        let factory = Box::new(AdaptiveKalmanFilterFactory::new(motion.clone()));
        Self::with_filter_factory(config, motion, factory)
    }

    /// Create a tracker with a custom motion filter.
    ///
    /// # Errors
    /// `InvalidConfig` if either configuration section is invalid.
    pub fn with_filter_factory(
        config: TrackingConfig,
        motion: MotionConfig,
        filter_factory: Box<dyn MotionFilterFactory>,
    ) -> Result<Self> {
        config.validate()?;
        motion.validate()?;

        Ok(Self {
            store: TrackStore::new(config.capacity)?,
            ids: TrackIdFactory::new(),
            associator: Associator::new(config.iou_threshold, config.appearance_threshold),
            appearance: AppearanceUpdater::new(config.embedding_alpha),
            filter_factory,
            config,
            motion,
        })
    }

    pub fn store(&self) -> &TrackStore {
        &self.store
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Number of track ids issued so far.
    pub fn total_track_count(&self) -> u64 {
        self.ids.issued()
    }

    /// Number of live tracks.
    pub fn current_track_count(&self) -> usize {
        self.store.len()
    }

    /// Look up a live track.
    ///
    /// # Errors
    /// `UnknownTrack` if no live track has this id.
    pub fn track(&self, id: TrackId) -> Result<&Track> {
        self.store.get(id).ok_or(Error::UnknownTrack(id))
    }

    /// Run one tracking step.
    ///
    /// `None` means no detection batch arrived (missing input or timeout):
    /// every track is propagated as a ghost and nothing is created.
    ///
    /// # Arguments
    /// * `tick` - Frame tick the detections belong to
    /// * `detections` - The frame's detections, or `None` if none arrived
    ///
    /// # Returns
    /// The snapshot of live tracks after the step, the association result
    /// and the created, promoted, deleted and evicted ids.
    pub fn update(&mut self, tick: u64, detections: Option<Vec<Detection>>) -> TickTracking {
        let mut out = TickTracking {
            tick,
            missing_input: detections.is_none(),
            ..TickTracking::default()
        };

        let detections = match detections {
            Some(d) => self.admit_detections(d, &mut out),
            None => {
                debug!(tick, tracks = self.store.len(), "no detections, ghost-propagating all tracks");
                Vec::new()
            }
        };

        // Predict every live track to this tick.
        for track in self.store.iter_mut() {
            track.age += 1;
            if track.filter.predict(track.confidence) == FilterHealth::Reset {
                out.filter_resets += 1;
            }
            track.position = track.filter.position();
            track.bbox.center = track.position;
        }

        let association = {
            let candidates: Vec<&Track> = self.store.iter().filter(|t| t.is_live()).collect();
            self.associator.associate(&detections, &candidates)
        };

        for m in &association.matches {
            let detection = &detections[m.detection_idx];
            if let Some(promoted) = self.apply_match(m.track_id, detection, tick, &mut out) {
                out.promoted.push(promoted);
            }
        }
        for &id in &association.unmatched_tracks {
            self.apply_miss(id);
        }

        for track in self.store.iter_mut() {
            track.refresh_kinematics(&self.motion);
            track.refresh_quality();
        }
        out.deleted = self.store.purge_deleted();

        for &det_idx in &association.unmatched_detections {
            self.spawn(&detections[det_idx], tick, &mut out);
        }

        out.association = association;
        out.snapshot = self.store.snapshot(tick);
        out
    }

    /// Drop invalid detections and enforce the per-frame cap.
    fn admit_detections(&self, detections: Vec<Detection>, out: &mut TickTracking) -> Vec<Detection> {
        let total = detections.len();
        let mut valid: Vec<Detection> = detections
            .into_iter()
            .filter(|d| match d.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "skipping invalid detection");
                    false
                }
            })
            .collect();

        if valid.len() > self.config.max_detections_per_frame {
            valid.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            warn!(
                received = valid.len(),
                limit = self.config.max_detections_per_frame,
                "too many detections, dropping lowest confidence"
            );
            valid.truncate(self.config.max_detections_per_frame);
        }

        out.rejected_detections = total - valid.len();
        valid
    }

    /// Update a matched track. Returns the promotion if it was confirmed this tick.
    fn apply_match(
        &mut self,
        id: TrackId,
        detection: &Detection,
        tick: u64,
        out: &mut TickTracking,
    ) -> Option<(TrackId, Category)> {
        let threshold = self.config.tentative_threshold;
        let history_length = self.config.history_length;
        let appearance = self.appearance;
        let track = self.store.get_mut(id)?;

        if track.filter.update(&measurement_from(detection)) == FilterHealth::Reset {
            out.filter_resets += 1;
        }
        track.position = track.filter.position();

        track.time_since_update = 0;
        track.hit_streak += 1;
        track.total_hits += 1;
        track.confidence = detection.confidence.clamp(0.0, 1.0);
        track.bbox.depth = detection.bbox.depth;
        if detection.category.representation().is_some() || track.category.representation().is_none() {
            track.category = detection.category;
        }
        appearance.update(track, detection.embedding.as_deref());
        track.push_history(tick, detection.pose, history_length);

        let was_ghost = track.state == TrackState::Ghost;
        if track.confirmed || track.hit_streak >= threshold {
            track.state = TrackState::Active;
        } else {
            track.state = TrackState::Tentative;
        }

        if track.state == TrackState::Active && !track.confirmed {
            track.confirmed = true;
            info!(track_id = %id, category = track.category.label(), "track promoted to ACTIVE");
            return Some((id, track.category));
        }
        if was_ghost {
            debug!(track_id = %id, state = ?track.state, "ghost track reacquired");
        }
        None
    }

    /// Propagate an unmatched track as a ghost, deleting it past `max_age`.
    fn apply_miss(&mut self, id: TrackId) {
        let max_age = self.config.max_age;
        let decay = self.config.confidence_decay;
        let Some(track) = self.store.get_mut(id) else {
            return;
        };

        track.time_since_update += 1;
        track.hit_streak = 0;
        track.confidence = (track.confidence * decay).clamp(0.0, 1.0);

        if track.time_since_update > max_age {
            track.state = TrackState::Deleted;
        } else if track.state != TrackState::Ghost {
            track.state = TrackState::Ghost;
            debug!(track_id = %id, "track lost, now GHOST");
        }
    }

    /// Create a TENTATIVE track and admit it to the store.
    fn spawn(&mut self, detection: &Detection, tick: u64, out: &mut TickTracking) {
        let id = self.ids.next_id();
        let filter = self.filter_factory.create_filter(detection);
        let track = Track::new(id, detection, filter, tick, self.config.history_length);
        debug!(track_id = %id, category = detection.category.label(), "track created");

        match self.store.upsert(track) {
            Ok(Some(evicted)) => {
                out.evicted.push(evicted.id);
                if evicted.id != id {
                    out.created.push(id);
                }
            }
            Ok(None) => out.created.push(id),
            Err(e) => warn!(track_id = %id, error = %e, "track not admitted"),
        }
    }
}
