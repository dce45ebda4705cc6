//! Bounded track store.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::track::{Track, TrackId, TrackSnapshot, TrackState};
use crate::{Error, Result};

/// Bounded map `TrackId -> Track` with lowest-quality eviction.
///
/// Owned by the tracking stage, which is its only writer.
#[derive(Debug)]
pub struct TrackStore {
    capacity: usize,
    tracks: BTreeMap<TrackId, Track>,
}

impl TrackStore {
    /// # Errors
    /// `InvalidConfig` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "track store capacity must be > 0".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            tracks: BTreeMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.tracks.contains_key(&id)
    }

    /// Tracks in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    /// Insert or replace a track, then enforce capacity.
    ///
    /// Returns the evicted track, if any. The new track itself competes in the
    /// eviction and is dropped if it has the lowest quality.
    ///
    /// # Errors
    /// `CapacityExhausted` if no track can be evicted. The insert is then
    /// undone, so the store never holds more than `capacity` tracks.
    pub fn upsert(&mut self, track: Track) -> Result<Option<Track>> {
        let id = track.id;
        let previous = self.tracks.insert(id, track);
        self.evict_if_over_capacity().map_err(|e| {
            self.tracks.remove(&id);
            if let Some(previous) = previous {
                self.tracks.insert(id, previous);
            }
            warn!(track_id = %id, capacity = self.capacity, "track store full, track not admitted");
            e
        })
    }

    /// Evict one track when over capacity.
    ///
    /// The victim has the lowest finite `quality_score`, ties broken by largest
    /// `time_since_update`, then by oldest id.
    pub fn evict_if_over_capacity(&mut self) -> Result<Option<Track>> {
        if self.tracks.len() <= self.capacity {
            return Ok(None);
        }

        let victim = self
            .tracks
            .values()
            .filter(|t| t.quality_score.is_finite())
            .min_by(|a, b| eviction_order(a, b))
            .map(|t| t.id);

        let Some(victim) = victim else {
            return Err(Error::CapacityExhausted {
                capacity: self.capacity,
            });
        };

        let evicted = self.tracks.remove(&victim);
        if let Some(ref t) = evicted {
            warn!(
                track_id = %t.id,
                quality = t.quality_score,
                time_since_update = t.time_since_update,
                "track store at capacity, evicting lowest-quality track"
            );
        }

        if self.tracks.len() > self.capacity {
            return Err(Error::CapacityExhausted {
                capacity: self.capacity,
            });
        }
        Ok(evicted)
    }

    /// Immutable copy of all live tracks.
    pub fn snapshot(&self, tick: u64) -> TrackSnapshot {
        TrackSnapshot::new(
            tick,
            self.tracks.values().filter(|t| t.is_live()).cloned().collect(),
        )
    }

    pub(crate) fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    /// Remove tracks marked DELETED, returning their ids.
    pub(crate) fn purge_deleted(&mut self) -> Vec<TrackId> {
        let deleted: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| t.state == TrackState::Deleted)
            .map(|t| t.id)
            .collect();
        for id in &deleted {
            self.tracks.remove(id);
            debug!(track_id = %id, "track deleted");
        }
        deleted
    }
}

fn eviction_order(a: &Track, b: &Track) -> Ordering {
    a.quality_score
        .total_cmp(&b.quality_score)
        .then_with(|| b.time_since_update.cmp(&a.time_since_update))
        .then_with(|| a.id.cmp(&b.id))
}
