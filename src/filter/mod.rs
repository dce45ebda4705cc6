//! Motion estimation for tracked objects.
//!
//! - `MotionFilter` / `MotionFilterFactory` - the per-track estimator seam
//! - `AdaptiveKalmanFilter` - 8-state constant-velocity filter whose process
//!   noise grows as detection confidence drops, with degenerate-covariance reset

mod adaptive;
mod traits;

pub use adaptive::{AdaptiveKalmanFilter, AdaptiveKalmanFilterFactory, DIM_X, DIM_Z};
pub use traits::{measurement_from, FilterHealth, MotionFilter, MotionFilterFactory};
