//! Motion filter traits.

use std::fmt;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::detection::Detection;

/// Outcome of a filter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHealth {
    /// Step completed with a well-conditioned covariance.
    Nominal,
    /// Covariance became degenerate and the filter was reset to a wide prior.
    Reset,
}

/// Per-track motion estimator.
///
/// The state layout is `[x, y, z, vx, vy, vz, w, h]`; measurements are
/// `[x, y, z, w, h]`.
pub trait MotionFilter: Send + Sync + fmt::Debug {
    /// Propagate one tick. `confidence` scales the injected process noise
    /// inversely: lower confidence widens the prediction.
    fn predict(&mut self, confidence: f64) -> FilterHealth;

    /// Correct the state with a detection-derived measurement.
    fn update(&mut self, measurement: &DVector<f64>) -> FilterHealth;

    /// Full state vector.
    fn state(&self) -> &DVector<f64>;

    /// State covariance.
    fn covariance(&self) -> &DMatrix<f64>;

    fn clone_box(&self) -> Box<dyn MotionFilter>;

    fn position(&self) -> Vector3<f64> {
        let x = self.state();
        Vector3::new(x[0], x[1], x[2])
    }

    fn velocity(&self) -> Vector3<f64> {
        let x = self.state();
        Vector3::new(x[3], x[4], x[5])
    }

    /// Filtered `(width, height)`.
    fn extent(&self) -> (f64, f64) {
        let x = self.state();
        (x[6], x[7])
    }

    /// One-sigma position uncertainty per axis.
    fn position_uncertainty(&self) -> Vector3<f64> {
        let p = self.covariance();
        Vector3::new(p[(0, 0)], p[(1, 1)], p[(2, 2)]).map(|v| v.max(0.0).sqrt())
    }
}

impl Clone for Box<dyn MotionFilter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Creates a filter for each new track.
pub trait MotionFilterFactory: Send + Sync {
    /// Create a filter initialized at the detection with zero velocity.
    fn create_filter(&self, detection: &Detection) -> Box<dyn MotionFilter>;
}

/// Measurement vector `[x, y, z, w, h]` for a detection.
pub fn measurement_from(detection: &Detection) -> DVector<f64> {
    let c = detection.bbox.center;
    DVector::from_vec(vec![
        c.x,
        c.y,
        c.z,
        detection.bbox.width,
        detection.bbox.height,
    ])
}
