//! Cross-validation of kinematic velocity against an independent estimate.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::track::{Track, TrackId};
use crate::{Error, Result};

/// Agreement between the tracker's velocity and the reference estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// Estimates agree within the threshold.
    Validated,
    /// Estimates diverge; treated as low confidence downstream.
    Uncertain,
    /// No reference estimate was available.
    Unvalidated,
}

impl Default for ValidationStatus {
    fn default() -> Self {
        ValidationStatus::Unvalidated
    }
}

/// Independent per-object motion estimate (e.g. optical flow).
pub trait MotionReference: Send + Sync {
    /// Metric velocity of `track` in the world frame, if it can be measured.
    fn velocity_at(&self, track: &Track) -> Option<Vector3<f64>>;
}

/// Compare the two estimates in the image-plane axes (`x`, `y`).
pub fn cross_validate(
    kinematic: &Vector3<f64>,
    reference: Option<&Vector3<f64>>,
    threshold: f64,
) -> ValidationStatus {
    let Some(reference) = reference else {
        return ValidationStatus::Unvalidated;
    };
    let dx = kinematic.x - reference.x;
    let dy = kinematic.y - reference.y;
    let divergence = (dx * dx + dy * dy).sqrt();
    if divergence.is_nan() || divergence > threshold {
        ValidationStatus::Uncertain
    } else {
        ValidationStatus::Validated
    }
}

/// Any UNCERTAIN wins, then any VALIDATED, else UNVALIDATED.
pub fn aggregate_validation(statuses: impl IntoIterator<Item = ValidationStatus>) -> ValidationStatus {
    let mut any_validated = false;
    for status in statuses {
        match status {
            ValidationStatus::Uncertain => return ValidationStatus::Uncertain,
            ValidationStatus::Validated => any_validated = true,
            ValidationStatus::Unvalidated => {}
        }
    }
    if any_validated {
        ValidationStatus::Validated
    } else {
        ValidationStatus::Unvalidated
    }
}

/// Pinhole camera parameters in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Dense optical flow (pixels per frame), row-major `[u, v]` per pixel.
///
/// Track positions are taken as camera-centred: `z` is depth along the
/// optical axis and `y` points up.
#[derive(Debug, Clone)]
pub struct FlowField {
    width: usize,
    height: usize,
    flow: Vec<[f64; 2]>,
    intrinsics: CameraIntrinsics,
    frame_rate: f64,
}

impl FlowField {
    /// # Errors
    /// `InvalidConfig` if `flow` does not hold `width * height` vectors, the
    /// focal lengths are not positive, or the frame rate is not positive.
    pub fn new(
        width: usize,
        height: usize,
        flow: Vec<[f64; 2]>,
        intrinsics: CameraIntrinsics,
        frame_rate: f64,
    ) -> Result<Self> {
        if flow.len() != width * height {
            return Err(Error::InvalidConfig(format!(
                "flow field has {} vectors, expected {}x{}",
                flow.len(),
                width,
                height
            )));
        }
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 || frame_rate <= 0.0 {
            return Err(Error::InvalidConfig(
                "focal lengths and frame rate must be positive".to_string(),
            ));
        }
        Ok(Self {
            width,
            height,
            flow,
            intrinsics,
            frame_rate,
        })
    }

    /// Uniform flow over the whole image.
    pub fn uniform(
        width: usize,
        height: usize,
        vector: [f64; 2],
        intrinsics: CameraIntrinsics,
        frame_rate: f64,
    ) -> Result<Self> {
        Self::new(width, height, vec![vector; width * height], intrinsics, frame_rate)
    }

    /// Pixel onto which `point` projects, if inside the image.
    fn project(&self, point: &Vector3<f64>) -> Option<(usize, usize)> {
        if !(point.z > 0.0) {
            return None;
        }
        let k = &self.intrinsics;
        let u = (k.fx * point.x / point.z + k.cx).floor();
        let v = (k.cy - k.fy * point.y / point.z).floor();
        if u < 0.0 || v < 0.0 || u >= self.width as f64 || v >= self.height as f64 {
            return None;
        }
        Some((u as usize, v as usize))
    }
}

impl MotionReference for FlowField {
    fn velocity_at(&self, track: &Track) -> Option<Vector3<f64>> {
        let (u, v) = self.project(&track.position)?;
        let [du, dv] = self.flow[v * self.width + u];
        let depth = track.position.z;
        let k = &self.intrinsics;
        let vx = du * depth / k.fx * self.frame_rate;
        // Image rows grow downward
        let vy = -dv * depth / k.fy * self.frame_rate;
        Some(Vector3::new(vx, vy, 0.0))
    }
}

/// Reference velocities keyed by track, for replay and simulation.
#[derive(Debug, Clone, Default)]
pub struct VelocityTable {
    velocities: BTreeMap<TrackId, Vector3<f64>>,
}

impl VelocityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TrackId, velocity: Vector3<f64>) -> Option<Vector3<f64>> {
        self.velocities.insert(id, velocity)
    }

    pub fn with(mut self, id: TrackId, velocity: Vector3<f64>) -> Self {
        self.velocities.insert(id, velocity);
        self
    }
}

impl MotionReference for VelocityTable {
    fn velocity_at(&self, track: &Track) -> Option<Vector3<f64>> {
        self.velocities.get(&track.id).copied()
    }
}
