// src/pipeline/processor.rs
//
// Per-session orchestration: detect -> calibrate (on schedule) ->
// track -> transform -> publish. Owns all mutable cross-frame state
// (calibration, tracker), so frames for one session must be fed
// strictly in order from a single thread. Per-frame failures in any
// subsystem degrade the frame's output; they never end the session.

use crate::calibration::{CoordinateTransformer, TableCalibrationEngine};
use crate::detection::{BallClassifier, BallDetectionEngine};
use crate::pipeline::api::{self, AnalysisPublisher, DetectionApi};
use crate::tracking::BallTracker;
use crate::types::{Config, Frame, FrameAnalysis};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessingStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub calibration_failures: u64,
    pub total_processing_ms: f64,
}

impl ProcessingStats {
    pub fn mean_processing_ms(&self) -> f64 {
        if self.frames_processed == 0 {
            0.0
        } else {
            self.total_processing_ms / self.frames_processed as f64
        }
    }
}

pub struct FrameProcessor {
    config: Config,
    detection: BallDetectionEngine,
    calibration: TableCalibrationEngine,
    tracker: BallTracker,
    publisher: AnalysisPublisher,
    stats: ProcessingStats,
    last_frame_ms: f64,
}

impl FrameProcessor {
    /// Build a session with the configured ONNX model. Fails only on
    /// model load problems; everything after construction is per-frame
    /// degradable.
    pub fn new(config: Config) -> Result<(Self, DetectionApi)> {
        let detection = BallDetectionEngine::new(&config.model, config.detection.clone())?;
        Ok(Self::assemble(config, detection))
    }

    /// Build a session around an arbitrary classifier backend.
    pub fn with_classifier(
        config: Config,
        classifier: Box<dyn BallClassifier>,
    ) -> (Self, DetectionApi) {
        let detection = BallDetectionEngine::with_classifier(classifier, config.detection.clone());
        Self::assemble(config, detection)
    }

    fn assemble(config: Config, detection: BallDetectionEngine) -> (Self, DetectionApi) {
        let calibration = TableCalibrationEngine::new(config.calibration.clone());
        let tracker = BallTracker::new(config.tracking.clone());
        let (publisher, api) = api::channel();

        (
            Self {
                config,
                detection,
                calibration,
                tracker,
                publisher,
                stats: ProcessingStats::default(),
                last_frame_ms: 0.0,
            },
            api,
        )
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }

    pub fn detection_engine(&self) -> &BallDetectionEngine {
        &self.detection
    }

    pub fn tracker(&self) -> &BallTracker {
        &self.tracker
    }

    pub fn calibration_engine(&self) -> &TableCalibrationEngine {
        &self.calibration
    }

    #[cfg(test)]
    fn calibration_engine_mut(&mut self) -> &mut TableCalibrationEngine {
        &mut self.calibration
    }

    /// Process one frame and publish its analysis. Returns `None` when
    /// the live-mode budget policy drops the frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Option<Arc<FrameAnalysis>> {
        // Live mode sheds load one frame at a time: an over-budget frame
        // causes the next frame to be skipped, not a growing backlog.
        if self.config.video.drop_late_frames && self.last_frame_ms > self.config.video.frame_budget_ms
        {
            debug!(
                frame = frame.frame_number,
                previous_ms = self.last_frame_ms,
                "dropping frame to recover budget"
            );
            self.stats.frames_dropped += 1;
            self.last_frame_ms = 0.0;
            return None;
        }

        let started = Instant::now();

        let detections = self.detection.detect(frame);

        if self.calibration.needs_recalibration(frame.frame_number) {
            match self.calibration.calibrate(frame, frame.frame_number) {
                Ok(true) => {}
                Ok(false) => self.stats.calibration_failures += 1,
                Err(e) => {
                    self.stats.calibration_failures += 1;
                    warn!(frame = frame.frame_number, error = %e, "calibration attempt errored");
                }
            }
        }

        let pockets = self
            .calibration
            .current()
            .map(|c| c.pocket_regions.clone())
            .unwrap_or_default();

        let mut tracked = self.tracker.update(&detections, frame.frame_number, &pockets);

        // Table coordinates only when a valid calibration is serving;
        // otherwise pixel-space data flows with table_position unset.
        if let Some(cal) = self.calibration.current() {
            if let Ok(transformer) = CoordinateTransformer::new(cal) {
                for ball in &mut tracked {
                    ball.table_position = transformer.pixel_to_table(ball.current_position).ok();
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.last_frame_ms = elapsed_ms;
        self.stats.frames_processed += 1;
        self.stats.total_processing_ms += elapsed_ms;

        let analysis = FrameAnalysis {
            frame_number: frame.frame_number,
            timestamp: frame.timestamp,
            detections,
            tracked_balls: tracked,
            calibration: self.calibration.current().cloned(),
            processing_time_ms: elapsed_ms,
        };

        Some(self.publisher.publish(analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::detection::RawDetection;
    use crate::types::{BallType, TrackState};

    /// Scripted classifier emitting a fixed sequence of detections.
    struct ScriptedClassifier {
        frames: Vec<Vec<RawDetection>>,
        cursor: usize,
    }

    impl BallClassifier for ScriptedClassifier {
        fn classify(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            let dets = self.frames.get(self.cursor).cloned().unwrap_or_default();
            self.cursor += 1;
            Ok(dets)
        }
    }

    fn frame(n: u64) -> Frame {
        Frame {
            data: vec![0u8; 64 * 48 * 3],
            width: 64,
            height: 48,
            frame_number: n,
            timestamp: n as f64 / 30.0,
        }
    }

    fn raw(cx: f32, cy: f32, class_id: usize) -> RawDetection {
        RawDetection {
            bbox: [cx - 4.0, cy - 4.0, cx + 4.0, cy + 4.0],
            class_id,
            confidence: 0.9,
        }
    }

    fn session(frames: Vec<Vec<RawDetection>>) -> (FrameProcessor, DetectionApi) {
        let classifier = ScriptedClassifier { frames, cursor: 0 };
        FrameProcessor::with_classifier(test_config(), Box::new(classifier))
    }

    #[test]
    fn test_empty_frames_keep_session_alive() {
        let (mut processor, api) = session(Vec::new());

        for f in 0..10 {
            let analysis = processor.process_frame(&frame(f)).unwrap();
            assert!(analysis.detections.is_empty());
            assert!(analysis.tracked_balls.is_empty());
        }

        assert_eq!(processor.stats().frames_processed, 10);
        assert_eq!(api.latest().unwrap().frame_number, 9);
    }

    #[test]
    fn test_detection_flows_into_tracking() {
        let script = vec![
            vec![raw(20.0, 20.0, 1)],
            vec![raw(22.0, 20.0, 1)],
            vec![raw(24.0, 20.0, 1)],
        ];
        let (mut processor, _api) = session(script);

        let mut last = None;
        for f in 0..3 {
            last = processor.process_frame(&frame(f));
        }

        let analysis = last.unwrap();
        assert_eq!(analysis.detections.len(), 1);
        assert_eq!(analysis.tracked_balls.len(), 1);
        let ball = &analysis.tracked_balls[0];
        assert_eq!(ball.ball_type, BallType::Red);
        assert_eq!(ball.state, TrackState::Active);
        assert_eq!(ball.trajectory.len(), 3);
    }

    #[test]
    fn test_uncalibrated_frames_carry_no_table_positions() {
        // Black synthetic frames have no cushion edges to calibrate on.
        let script = vec![vec![raw(20.0, 20.0, 1)]];
        let (mut processor, _api) = session(script);

        let analysis = processor.process_frame(&frame(0)).unwrap();
        assert!(analysis.tracked_balls[0].table_position.is_none());
        assert!(analysis.calibration.is_none());
        assert!(processor.stats().calibration_failures >= 1);
        assert_ne!(
            processor.calibration_engine().state(),
            crate::calibration::CalibrationState::Calibrated
        );
    }

    #[test]
    fn test_calibrated_session_survives_empty_frames() {
        let mut script = vec![
            vec![raw(20.0, 20.0, 1)],
            vec![raw(22.0, 20.0, 1)],
            vec![raw(24.0, 20.0, 1)],
        ];
        script.extend(std::iter::repeat(Vec::new()).take(15));
        let (mut processor, _api) = session(script);

        let corners = [
            crate::types::Point::new(5.0, 5.0),
            crate::types::Point::new(60.0, 5.0),
            crate::types::Point::new(60.0, 44.0),
            crate::types::Point::new(5.0, 44.0),
        ];
        processor
            .calibration_engine_mut()
            .calibrate_from_corners(corners, (64, 48), 0, 0.0)
            .unwrap();
        let cal_ts = processor.calibration_engine().current().unwrap().timestamp;

        let mut last = None;
        for f in 0..18 {
            last = processor.process_frame(&frame(f));
        }

        // Track established, then expired after the disappearance budget;
        // the calibration from frame 0 is still the one serving.
        let analysis = last.unwrap();
        assert!(analysis.tracked_balls.is_empty());
        let cal = analysis.calibration.as_ref().unwrap();
        assert!(cal.is_valid);
        assert_eq!(cal.timestamp, cal_ts);
    }

    #[test]
    fn test_calibrated_frames_carry_table_positions() {
        let script = vec![vec![raw(20.0, 20.0, 1)]];
        let (mut processor, _api) = session(script);

        let corners = [
            crate::types::Point::new(5.0, 5.0),
            crate::types::Point::new(60.0, 5.0),
            crate::types::Point::new(60.0, 44.0),
            crate::types::Point::new(5.0, 44.0),
        ];
        processor
            .calibration_engine_mut()
            .calibrate_from_corners(corners, (64, 48), 0, 0.0)
            .unwrap();

        let analysis = processor.process_frame(&frame(0)).unwrap();
        let table_pos = analysis.tracked_balls[0].table_position.unwrap();
        assert!(table_pos.x > 0.0 && table_pos.x < 3.569);
        assert!(table_pos.y > 0.0 && table_pos.y < 1.778);
    }

    #[test]
    fn test_live_mode_drops_frame_after_budget_overrun() {
        let mut config = test_config();
        config.video.drop_late_frames = true;
        config.video.frame_budget_ms = 0.0;

        let classifier = ScriptedClassifier {
            frames: Vec::new(),
            cursor: 0,
        };
        let (mut processor, _api) = FrameProcessor::with_classifier(config, Box::new(classifier));

        assert!(processor.process_frame(&frame(0)).is_some());
        // The first frame necessarily exceeded a zero budget.
        assert!(processor.process_frame(&frame(1)).is_none());
        // Recovery: the skip resets the debt.
        assert!(processor.process_frame(&frame(2)).is_some());

        assert_eq!(processor.stats().frames_dropped, 1);
        assert_eq!(processor.stats().frames_processed, 2);
    }

    #[test]
    fn test_stream_sees_every_processed_frame() {
        let (mut processor, api) = session(Vec::new());
        let rx = api.take_stream().unwrap();

        for f in 0..4 {
            processor.process_frame(&frame(f));
        }
        drop(processor);

        let frames: Vec<u64> = rx.iter().map(|a| a.frame_number).collect();
        assert_eq!(frames, vec![0, 1, 2, 3]);
    }
}
