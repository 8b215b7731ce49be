// src/error.rs

use thiserror::Error;

/// Error taxonomy for the analysis pipeline.
///
/// Only `Configuration` is fatal (raised at session start, before any
/// frame is processed). The per-frame categories are absorbed by the
/// component that hits them, logged with frame context, and degrade
/// the output rather than stopping the session.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model load or inference failure. Recovered locally by returning
    /// an empty detection set for the affected frame.
    #[error("detection failed: {0}")]
    Detection(String),

    /// Corner or homography computation failure. Recovered by keeping
    /// the previous valid calibration.
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Transform attempted without a valid calibration. Surfaced to the
    /// caller; pixel-space data is still available.
    #[error("coordinate transform unavailable: {0}")]
    Coordinate(String),

    /// Assignment solver failure. Recovered via greedy fallback matching.
    #[error("tracking failed: {0}")]
    Tracking(String),

    /// Invalid startup parameters. Fatal at session start.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}
