//! Exponential-moving-average maintenance of track embeddings.

use tracing::debug;

use crate::track::Track;

/// Blends matched detection embeddings into a track's identity embedding.
#[derive(Debug, Clone, Copy)]
pub struct AppearanceUpdater {
    /// Weight of the stored embedding.
    pub alpha: f64,
}

impl AppearanceUpdater {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Fold `observation` into the track embedding.
    ///
    /// Call only for matched tracks; ghosts keep their last embedding. A track
    /// without an embedding, or with one of a different dimension, adopts the
    /// observation as-is.
    pub fn update(&self, track: &mut Track, observation: Option<&[f64]>) {
        let Some(observation) = observation else {
            return;
        };

        match track.embedding.as_mut() {
            Some(current) if current.len() == observation.len() => {
                blend(current, observation, self.alpha);
            }
            Some(current) => {
                debug!(
                    track_id = %track.id,
                    stored = current.len(),
                    observed = observation.len(),
                    "embedding dimension changed, replacing"
                );
                *current = observation.to_vec();
            }
            None => track.embedding = Some(observation.to_vec()),
        }
    }
}

/// `current <- alpha * current + (1 - alpha) * observation`, then unit-normalize.
pub fn blend(current: &mut [f64], observation: &[f64], alpha: f64) {
    for (c, o) in current.iter_mut().zip(observation) {
        *c = alpha * *c + (1.0 - alpha) * o;
    }
    let norm = current.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        current.iter_mut().for_each(|v| *v /= norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;
    use crate::detection::{Category, Detection};
    use crate::filter::{AdaptiveKalmanFilterFactory, MotionFilterFactory};
    use crate::track::TrackId;
    use approx::assert_relative_eq;

    fn track(embedding: Option<Vec<f64>>) -> Track {
        let mut det = Detection::from_center([0.0, 0.5, 10.0], [1.0; 3], Category::Person(None), 0.9).unwrap();
        det.embedding = embedding;
        let filter = AdaptiveKalmanFilterFactory::new(MotionConfig::default()).create_filter(&det);
        Track::new(TrackId(0), &det, filter, 0, 10)
    }

    #[test]
    fn test_blend_favors_history() {
        let mut current = vec![1.0, 0.0];
        blend(&mut current, &[0.0, 1.0], 0.7);

        // (0.7, 0.3) normalized
        let norm = (0.49f64 + 0.09).sqrt();
        assert_relative_eq!(current[0], 0.7 / norm, epsilon = 1e-12);
        assert_relative_eq!(current[1], 0.3 / norm, epsilon = 1e-12);
        assert!(current[0] > current[1]);
    }

    #[test]
    fn test_update_adopts_first_embedding() {
        let mut t = track(None);
        AppearanceUpdater::new(0.7).update(&mut t, Some(&[0.0, 2.0]));
        assert_eq!(t.embedding, Some(vec![0.0, 2.0]));
    }

    #[test]
    fn test_update_without_observation_keeps_embedding() {
        let mut t = track(Some(vec![1.0, 0.0]));
        AppearanceUpdater::new(0.7).update(&mut t, None);
        assert_eq!(t.embedding, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_dimension_change_replaces() {
        let mut t = track(Some(vec![1.0, 0.0]));
        AppearanceUpdater::new(0.7).update(&mut t, Some(&[0.0, 0.0, 1.0]));
        assert_eq!(t.embedding, Some(vec![0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_repeated_updates_stay_unit_length() {
        let mut t = track(Some(vec![1.0, 0.0, 0.0]));
        let updater = AppearanceUpdater::new(0.7);
        for _ in 0..20 {
            updater.update(&mut t, Some(&[0.2, 0.5, 0.1]));
        }
        let e = t.embedding.unwrap();
        let norm: f64 = e.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-9);
        // Converges towards the observed direction
        assert!(e[1] > e[0]);
    }
}
