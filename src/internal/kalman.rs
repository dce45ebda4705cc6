//! Linear Kalman filter over dense matrices.

use nalgebra::{DMatrix, DVector};

/// Linear Kalman filter with public model matrices.
#[derive(Clone, Debug)]
pub struct KalmanFilter {
    pub dim_x: usize,
    pub dim_z: usize,
    /// State vector
    pub x: DVector<f64>,
    /// State covariance
    pub p: DMatrix<f64>,
    /// State transition
    pub f: DMatrix<f64>,
    /// Measurement model
    pub h: DMatrix<f64>,
    /// Measurement noise covariance
    pub r: DMatrix<f64>,
    /// Process noise covariance
    pub q: DMatrix<f64>,
}

impl KalmanFilter {
    /// Identity transition and covariances; `h` observes the first `dim_z` states.
    pub fn new(dim_x: usize, dim_z: usize) -> Self {
        let mut h = DMatrix::zeros(dim_z, dim_x);
        for i in 0..dim_z.min(dim_x) {
            h[(i, i)] = 1.0;
        }

        Self {
            dim_x,
            dim_z,
            x: DVector::zeros(dim_x),
            p: DMatrix::identity(dim_x, dim_x),
            f: DMatrix::identity(dim_x, dim_x),
            h,
            r: DMatrix::identity(dim_z, dim_z),
            q: DMatrix::identity(dim_x, dim_x),
        }
    }

    /// x = F x, P = F P F^T + Q
    pub fn predict(&mut self) {
        self.x = &self.f * &self.x;
        self.p = &self.f * &self.p * self.f.transpose() + &self.q;
    }

    /// Correct the state with measurement `z`.
    ///
    /// Returns `false` and leaves the state untouched when the innovation
    /// covariance is singular.
    pub fn update(&mut self, z: &DVector<f64>) -> bool {
        let innovation = z - &self.h * &self.x;
        let s = &self.h * &self.p * self.h.transpose() + &self.r;
        let Some(s_inv) = s.try_inverse() else {
            return false;
        };
        let gain = &self.p * self.h.transpose() * s_inv;

        self.x += &gain * innovation;
        let identity = DMatrix::<f64>::identity(self.dim_x, self.dim_x);
        let p = (identity - &gain * &self.h) * &self.p;
        // Keep P symmetric against round-off.
        self.p = (&p + p.transpose()) * 0.5;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_create() {
        let kf = KalmanFilter::new(4, 2);

        assert_eq!(kf.x.len(), 4);
        assert_eq!(kf.p.shape(), (4, 4));
        assert_eq!(kf.h.shape(), (2, 4));
        assert_relative_eq!(kf.h[(0, 0)], 1.0);
        assert_relative_eq!(kf.h[(1, 1)], 1.0);
        assert_relative_eq!(kf.h[(0, 2)], 0.0);
    }

    #[test]
    fn test_predict_constant_velocity() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.x = DVector::from_vec(vec![1.0, 2.0]);
        kf.f = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        kf.q = DMatrix::identity(2, 2) * 0.1;

        kf.predict();

        assert_relative_eq!(kf.x[0], 3.0, epsilon = 1e-10);
        assert_relative_eq!(kf.x[1], 2.0, epsilon = 1e-10);
        // P = F P F^T + Q = [2.1, 1; 1, 1.1]
        assert_relative_eq!(kf.p[(0, 0)], 2.1, epsilon = 1e-10);
        assert_relative_eq!(kf.p[(0, 1)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(kf.p[(1, 1)], 1.1, epsilon = 1e-10);
    }

    #[test]
    fn test_update_moves_towards_measurement() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.p = DMatrix::identity(2, 2) * 10.0;

        assert!(kf.update(&DVector::from_vec(vec![5.0])));

        // K = 10 / 11
        assert_relative_eq!(kf.x[0], 50.0 / 11.0, epsilon = 1e-9);
        assert_relative_eq!(kf.x[1], 0.0, epsilon = 1e-10);
        assert!(kf.p[(0, 0)] < 10.0);
    }

    #[test]
    fn test_tracks_linear_motion() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.f = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        kf.q = DMatrix::identity(2, 2) * 0.01;
        kf.r = DMatrix::identity(1, 1) * 0.1;

        for step in 1..=10 {
            kf.predict();
            kf.update(&DVector::from_vec(vec![step as f64]));
        }

        assert!((kf.x[0] - 10.0).abs() < 0.5);
        assert!((kf.x[1] - 1.0).abs() < 0.2);
    }

    #[test]
    fn test_singular_innovation_skips_update() {
        let mut kf = KalmanFilter::new(2, 1);
        kf.p = DMatrix::zeros(2, 2);
        kf.r = DMatrix::zeros(1, 1);
        let before = kf.x.clone();

        assert!(!kf.update(&DVector::from_vec(vec![3.0])));
        assert_eq!(kf.x, before);
    }
}
