//! Constant-velocity Kalman filter with confidence-scaled process noise.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::traits::{measurement_from, FilterHealth, MotionFilter, MotionFilterFactory};
use crate::config::MotionConfig;
use crate::detection::Detection;
use crate::internal::kalman::KalmanFilter;

pub const DIM_X: usize = 8;
pub const DIM_Z: usize = 5;

/// Largest variance still considered well-conditioned.
const MAX_VARIANCE: f64 = 1.0e12;

/// Adaptive Kalman filter over `[x, y, z, vx, vy, vz, w, h]`.
#[derive(Clone, Debug)]
pub struct AdaptiveKalmanFilter {
    kf: KalmanFilter,
    q_base: DMatrix<f64>,
    min_noise_confidence: f64,
    reset_variance: f64,
}

impl AdaptiveKalmanFilter {
    pub fn new(initial: &DVector<f64>, config: &MotionConfig) -> Self {
        let mut kf = KalmanFilter::new(DIM_X, DIM_Z);

        let dt = config.tick_interval;
        kf.f[(0, 3)] = dt;
        kf.f[(1, 4)] = dt;
        kf.f[(2, 5)] = dt;

        // z = [x, y, z, w, h]
        kf.h = DMatrix::zeros(DIM_Z, DIM_X);
        kf.h[(0, 0)] = 1.0;
        kf.h[(1, 1)] = 1.0;
        kf.h[(2, 2)] = 1.0;
        kf.h[(3, 6)] = 1.0;
        kf.h[(4, 7)] = 1.0;

        kf.r = DMatrix::identity(DIM_Z, DIM_Z) * config.measurement_noise;
        kf.p = DMatrix::identity(DIM_X, DIM_X) * config.initial_variance;

        kf.x[0] = initial[0];
        kf.x[1] = initial[1];
        kf.x[2] = initial[2];
        kf.x[6] = initial[3];
        kf.x[7] = initial[4];

        let q_base = DMatrix::identity(DIM_X, DIM_X) * config.process_noise;
        kf.q = q_base.clone();

        Self {
            kf,
            q_base,
            min_noise_confidence: config.min_noise_confidence,
            reset_variance: config.reset_variance,
        }
    }

    /// Whether the covariance or state is unusable.
    pub fn is_degenerate(&self) -> bool {
        if self.kf.x.iter().any(|v| !v.is_finite()) || self.kf.p.iter().any(|v| !v.is_finite()) {
            return true;
        }
        (0..DIM_X).any(|i| {
            let var = self.kf.p[(i, i)];
            var <= 0.0 || var > MAX_VARIANCE
        })
    }

    /// Reset to a wide prior, keeping the last finite position and extent.
    fn reset(&mut self, fallback: Option<&DVector<f64>>) {
        let mut x = DVector::zeros(DIM_X);
        for &i in &[0usize, 1, 2, 6, 7] {
            let current = self.kf.x[i];
            x[i] = if current.is_finite() {
                current
            } else {
                fallback.map(|z| z[measurement_index(i)]).unwrap_or(0.0)
            };
        }
        self.kf.x = x;
        self.kf.p = DMatrix::identity(DIM_X, DIM_X) * self.reset_variance;
        warn!(reset_variance = self.reset_variance, "motion filter covariance degenerate, reset to wide prior");
    }

    fn check(&mut self, fallback: Option<&DVector<f64>>) -> FilterHealth {
        if self.is_degenerate() {
            self.reset(fallback);
            FilterHealth::Reset
        } else {
            FilterHealth::Nominal
        }
    }

    #[cfg(test)]
    pub(crate) fn kalman_mut(&mut self) -> &mut KalmanFilter {
        &mut self.kf
    }
}

/// Map a state index carrying a measured quantity to its measurement index.
fn measurement_index(state_idx: usize) -> usize {
    match state_idx {
        6 => 3,
        7 => 4,
        i => i,
    }
}

impl MotionFilter for AdaptiveKalmanFilter {
    fn predict(&mut self, confidence: f64) -> FilterHealth {
        let scale = 1.0 / confidence.max(self.min_noise_confidence);
        self.kf.q = &self.q_base * scale;
        self.kf.predict();
        self.check(None)
    }

    fn update(&mut self, measurement: &DVector<f64>) -> FilterHealth {
        if measurement.iter().any(|v| !v.is_finite()) {
            return self.check(None);
        }
        if !self.kf.update(measurement) {
            self.reset(Some(measurement));
            return FilterHealth::Reset;
        }
        self.check(Some(measurement))
    }

    fn state(&self) -> &DVector<f64> {
        &self.kf.x
    }

    fn covariance(&self) -> &DMatrix<f64> {
        &self.kf.p
    }

    fn clone_box(&self) -> Box<dyn MotionFilter> {
        Box::new(self.clone())
    }
}

/// Builds [`AdaptiveKalmanFilter`]s from a [`MotionConfig`].
#[derive(Clone, Debug)]
pub struct AdaptiveKalmanFilterFactory {
    config: MotionConfig,
}

impl AdaptiveKalmanFilterFactory {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }
}

impl MotionFilterFactory for AdaptiveKalmanFilterFactory {
    fn create_filter(&self, detection: &Detection) -> Box<dyn MotionFilter> {
        Box::new(AdaptiveKalmanFilter::new(
            &measurement_from(detection),
            &self.config,
        ))
    }
}
