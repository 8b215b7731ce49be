// src/detection/mod.rs
//
// Ball detection: ONNX inference backend, validation, and NMS.

pub mod engine;
pub mod validator;

pub use engine::{BallClassifier, BallDetectionEngine, DetectionStats, OnnxBallClassifier};
pub use validator::RawDetection;
