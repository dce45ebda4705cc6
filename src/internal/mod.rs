//! Numeric building blocks used by the tracker.
//!
//! - `assignment`: minimum-cost bipartite assignment (Hungarian / Kuhn-Munkres)
//! - `kalman`: linear Kalman filter over dense matrices

pub mod assignment;
pub mod kalman;
