// src/detection/engine.rs
//
// ONNX ball detection. A YOLO-family model fine-tuned on the eight
// snooker ball classes runs through ort; the engine wraps the raw
// classifier with validation, class-aware NMS, and never-fatal error
// handling so one bad frame cannot take down a session.

use crate::detection::validator::{self, RawDetection};
use crate::error::PipelineError;
use crate::types::{Detection, DetectionConfig, Frame, ModelConfig, NUM_BALL_CLASSES};
use anyhow::Result;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info, warn};

// Model head layout: [x, y, w, h] + one score per ball class.
const YOLO_ATTRS: usize = 4 + NUM_BALL_CLASSES;

// ============================================================================
// CLASSIFIER TRAIT
// ============================================================================

/// Raw inference backend. The engine owns one behind a box so tests can
/// substitute a scripted classifier for the ONNX session.
pub trait BallClassifier: Send {
    fn classify(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

// ============================================================================
// ONNX BACKEND
// ============================================================================

pub struct OnnxBallClassifier {
    session: Session,
    input_size: usize,
    confidence_threshold: f32,
}

impl OnnxBallClassifier {
    pub fn new(config: &ModelConfig, confidence_threshold: f32) -> Result<Self> {
        let session = match Self::load_session(&config.path) {
            Ok(s) => s,
            Err(e) => match &config.fallback_path {
                Some(fallback) => {
                    warn!(
                        model = %config.path,
                        error = %e,
                        fallback = %fallback,
                        "primary model failed to load, trying fallback"
                    );
                    Self::load_session(fallback)?
                }
                None => return Err(e),
            },
        };

        Ok(Self {
            session,
            input_size: config.input_size,
            confidence_threshold,
        })
    }

    fn load_session(path: &str) -> Result<Session> {
        info!("Loading ball detection model: {}", path);
        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)?;
        info!("✓ ball detection model initialized");
        Ok(session)
    }

    /// Letterbox the frame into the model's square input, normalize to
    /// [0, 1], and convert HWC -> CHW. Returns the scale and padding
    /// needed to map detections back to image coordinates.
    fn preprocess(&self, frame: &Frame) -> (Vec<f32>, f32, f32, f32) {
        let target = self.input_size;
        let (src_w, src_h) = (frame.width, frame.height);

        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;
        let pad_x = (target - scaled_w) as f32 / 2.0;
        let pad_y = (target - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(&frame.data, src_w, src_h, scaled_w, scaled_h);

        let mut canvas = vec![114u8; target * target * 3];
        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_idx = ((y + pad_y as usize) * target + x + pad_x as usize) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        let mut input = vec![0.0f32; 3 * target * target];
        for c in 0..3 {
            for h in 0..target {
                for w in 0..target {
                    let hwc_idx = (h * target + w) * 3 + c;
                    let chw_idx = c * target * target + h * target + w;
                    input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
                }
            }
        }

        (input, scale, pad_x, pad_y)
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, self.input_size, self.input_size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value]?)?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_raw_tensor::<f32>()?;

        Ok(data.to_vec())
    }

    /// Parse the [1, 12, N] output head. N varies with input size, so it
    /// is derived from the buffer length rather than hardcoded.
    fn postprocess(
        &self,
        output: &[f32],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
    ) -> Vec<RawDetection> {
        let anchors = output.len() / YOLO_ATTRS;
        let mut detections = Vec::new();

        for i in 0..anchors {
            let cx = output[i];
            let cy = output[anchors + i];
            let w = output[anchors * 2 + i];
            let h = output[anchors * 3 + i];

            let mut max_conf = 0.0f32;
            let mut best_class = 0;
            for c in 0..NUM_BALL_CLASSES {
                let conf = output[anchors * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < self.confidence_threshold {
                continue;
            }

            // Center format -> corners, then reverse the letterbox.
            let x1 = (cx - w / 2.0 - pad_x) / scale;
            let y1 = (cy - h / 2.0 - pad_y) / scale;
            let x2 = (cx + w / 2.0 - pad_x) / scale;
            let y2 = (cy + h / 2.0 - pad_y) / scale;

            detections.push(RawDetection {
                bbox: [x1, y1, x2, y2],
                class_id: best_class,
                confidence: max_conf,
            });
        }

        detections
    }
}

impl BallClassifier for OnnxBallClassifier {
    fn classify(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(frame);
        let output = self.infer(&input)?;
        Ok(self.postprocess(&output, scale, pad_x, pad_y))
    }
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

// ============================================================================
// DETECTION ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionStats {
    pub frames: u64,
    pub total_detections: u64,
    pub dropped_invalid: u64,
    pub inference_failures: u64,
    /// Frames whose buffer length disagreed with their stated geometry.
    pub malformed_frames: u64,
    /// Running mean confidence over all accepted detections.
    pub mean_confidence: f32,
}

/// Per-frame detection front end: classify, validate, suppress
/// duplicates. Inference failures degrade to an empty detection list
/// for the frame; they never abort the session.
pub struct BallDetectionEngine {
    classifier: Box<dyn BallClassifier>,
    config: DetectionConfig,
    stats: DetectionStats,
}

impl BallDetectionEngine {
    pub fn new(model: &ModelConfig, config: DetectionConfig) -> Result<Self> {
        let classifier = OnnxBallClassifier::new(model, config.confidence_threshold)?;
        Ok(Self::with_classifier(Box::new(classifier), config))
    }

    pub fn with_classifier(classifier: Box<dyn BallClassifier>, config: DetectionConfig) -> Self {
        Self {
            classifier,
            config,
            stats: DetectionStats::default(),
        }
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats
    }

    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        self.stats.frames += 1;

        // Corrupt or variable-resolution streams can hand over a buffer
        // that disagrees with the stated geometry; preprocessing indexes
        // off width/height, so such a frame must never reach inference.
        let expected_len = frame.width * frame.height * 3;
        if frame.data.len() != expected_len {
            self.stats.malformed_frames += 1;
            let err = PipelineError::Detection(format!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                frame.data.len(),
                expected_len,
                frame.width,
                frame.height
            ));
            warn!(frame = frame.frame_number, error = %err, "skipping malformed frame");
            return Vec::new();
        }

        let raw = match self.classifier.classify(frame) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.inference_failures += 1;
                let err = PipelineError::Detection(format!("{e:#}"));
                warn!(
                    frame = frame.frame_number,
                    error = %err,
                    "emitting empty detection set for this frame"
                );
                return Vec::new();
            }
        };

        let (valid, dropped) = validator::validate(raw, frame.timestamp);
        self.stats.dropped_invalid += dropped as u64;

        let detections = validator::nms(valid, self.config.nms_iou_threshold);

        for det in &detections {
            let n = self.stats.total_detections as f32;
            self.stats.mean_confidence =
                (self.stats.mean_confidence * n + det.confidence) / (n + 1.0);
            self.stats.total_detections += 1;
        }

        debug!(
            frame = frame.frame_number,
            detections = detections.len(),
            dropped,
            "frame detection complete"
        );
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted classifier: pops one frame's worth of raw detections per
    /// classify() call.
    pub(crate) struct ScriptedClassifier {
        script: Vec<Result<Vec<RawDetection>, String>>,
        cursor: usize,
    }

    impl ScriptedClassifier {
        pub(crate) fn new(script: Vec<Result<Vec<RawDetection>, String>>) -> Self {
            Self { script, cursor: 0 }
        }
    }

    impl BallClassifier for ScriptedClassifier {
        fn classify(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            let step = self.script.get(self.cursor).cloned().unwrap_or(Ok(Vec::new()));
            self.cursor += 1;
            step.map_err(|m| anyhow::anyhow!(m))
        }
    }

    fn frame(n: u64) -> Frame {
        Frame {
            data: vec![0; 64 * 48 * 3],
            width: 64,
            height: 48,
            frame_number: n,
            timestamp: n as f64 / 30.0,
        }
    }

    fn raw(bbox: [f32; 4], class_id: usize, confidence: f32) -> RawDetection {
        RawDetection {
            bbox,
            class_id,
            confidence,
        }
    }

    fn engine_config() -> DetectionConfig {
        DetectionConfig {
            confidence_threshold: 0.2,
            nms_iou_threshold: 0.5,
        }
    }

    #[test]
    fn test_detect_validates_and_counts() {
        let script = vec![Ok(vec![
            raw([10.0, 10.0, 30.0, 30.0], 1, 0.9),
            raw([10.0, 10.0, 30.0, 30.0], 99, 0.9), // unknown class
        ])];
        let mut engine =
            BallDetectionEngine::with_classifier(Box::new(ScriptedClassifier::new(script)), engine_config());

        let dets = engine.detect(&frame(0));
        assert_eq!(dets.len(), 1);
        let stats = engine.stats();
        assert_eq!(stats.total_detections, 1);
        assert_eq!(stats.dropped_invalid, 1);
        assert!((stats.mean_confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_inference_failure_degrades_to_empty() {
        let script = vec![
            Err("onnx runtime exploded".to_string()),
            Ok(vec![raw([10.0, 10.0, 30.0, 30.0], 0, 0.7)]),
        ];
        let mut engine =
            BallDetectionEngine::with_classifier(Box::new(ScriptedClassifier::new(script)), engine_config());

        assert!(engine.detect(&frame(0)).is_empty());
        assert_eq!(engine.stats().inference_failures, 1);

        // Next frame recovers.
        assert_eq!(engine.detect(&frame(1)).len(), 1);
    }

    #[test]
    fn test_truncated_frame_buffer_degrades_to_empty() {
        let script = vec![Ok(vec![raw([10.0, 10.0, 30.0, 30.0], 1, 0.9)])];
        let mut engine =
            BallDetectionEngine::with_classifier(Box::new(ScriptedClassifier::new(script)), engine_config());

        // Header claims 64x48 but the decoder produced fewer bytes.
        let mut bad = frame(0);
        bad.data.truncate(100);

        assert!(engine.detect(&bad).is_empty());
        assert_eq!(engine.stats().malformed_frames, 1);
        assert_eq!(engine.stats().inference_failures, 0);

        // An intact frame afterwards still detects.
        assert_eq!(engine.detect(&frame(1)).len(), 1);
    }

    #[test]
    fn test_duplicate_boxes_suppressed() {
        let script = vec![Ok(vec![
            raw([10.0, 10.0, 30.0, 30.0], 1, 0.9),
            raw([11.0, 11.0, 31.0, 31.0], 1, 0.5),
        ])];
        let mut engine =
            BallDetectionEngine::with_classifier(Box::new(ScriptedClassifier::new(script)), engine_config());

        let dets = engine.detect(&frame(0));
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }
}
