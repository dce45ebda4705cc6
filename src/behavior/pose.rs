//! Short-horizon body-orientation forecast for persons.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use super::EgoState;
use crate::track::Track;
use crate::utils::{clamp_unit, wrap_angle};

/// Below this speed (m/s) a person is considered stationary.
const STATIONARY_SPEED: f64 = 0.1;

/// Coarse walking direction relative to the rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalkDirection {
    Stationary,
    TowardTrack,
    AwayFromTrack,
    Parallel,
}

/// Orientation-derived cues feeding intent inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseForecast {
    /// Current facing score in [0, 1]; 1 is facing the track.
    pub facing: f64,
    /// Facing score extrapolated over the lookahead.
    pub predicted_facing: f64,
    /// Yaw rate in rad/s from the two most recent samples.
    pub angular_velocity: f64,
    pub rotating_towards: bool,
    pub walk_direction: WalkDirection,
    /// Latest head pitch in radians.
    pub head_pitch: f64,
    pub hand_to_head: f64,
    pub carrying: f64,
}

/// `1 - |yaw| / pi` with yaw wrapped to (-pi, pi].
pub fn facing_score(yaw: f64) -> f64 {
    clamp_unit(1.0 - wrap_angle(yaw).abs() / PI)
}

/// Forecast a person's orientation `lookahead` seconds ahead.
///
/// Returns `None` for non-persons and tracks without pose samples.
pub fn forecast(track: &Track, ego: &EgoState, lookahead: f64, tick_interval: f64) -> Option<PoseForecast> {
    if !track.category.is_person() {
        return None;
    }

    let mut poses = track.poses().collect::<Vec<_>>().into_iter().rev();
    let (latest_tick, latest) = poses.next()?;
    let previous = poses.next();

    let angular_velocity = match previous {
        Some((prev_tick, prev)) if latest_tick > prev_tick => {
            let dt = (latest_tick - prev_tick) as f64 * tick_interval;
            wrap_angle(latest.orientation - prev.orientation) / dt
        }
        _ => 0.0,
    };

    let facing = facing_score(latest.orientation);
    let predicted_facing = facing_score(latest.orientation + angular_velocity * lookahead);

    Some(PoseForecast {
        facing,
        predicted_facing,
        angular_velocity,
        rotating_towards: predicted_facing > facing + 1e-9,
        walk_direction: walk_direction(track, ego),
        head_pitch: latest.head_pitch,
        hand_to_head: latest.hand_to_head,
        carrying: latest.carrying,
    })
}

/// Classify the track's motion relative to the rail.
pub fn walk_direction(track: &Track, ego: &EgoState) -> WalkDirection {
    if track.speed() < STATIONARY_SPEED {
        return WalkDirection::Stationary;
    }
    let lateral = track.velocity.dot(&ego.lateral_axis());
    let along = track.velocity.dot(&ego.rail_direction());
    if lateral.abs() <= along.abs() {
        return WalkDirection::Parallel;
    }
    if ego.lateral_closing_speed(&track.position, &track.velocity) > 0.0 {
        WalkDirection::TowardTrack
    } else {
        WalkDirection::AwayFromTrack
    }
}
