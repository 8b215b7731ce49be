// src/pipeline/mod.rs

pub mod api;
pub mod processor;

pub use api::{AnalysisPublisher, DetectionApi};
pub use processor::{FrameProcessor, ProcessingStats};
