// src/tracking/mod.rs
//
// Ball tracking: Kalman filtering, Hungarian association, and the
// per-frame track lifecycle.

pub mod hungarian;
pub mod kalman;
pub mod tracker;

pub use tracker::{BallTracker, TrackingStats};
