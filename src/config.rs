use crate::error::PipelineError;
use crate::types::Config;
use anyhow::Result;
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation at session start. Any violation here is a
    /// hard error; no partial session is created.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model.path.is_empty() {
            return Err(PipelineError::Configuration(
                "model.path must not be empty".into(),
            ));
        }
        if self.model.input_size == 0 {
            return Err(PipelineError::Configuration(
                "model.input_size must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(PipelineError::Configuration(format!(
                "detection.confidence_threshold {} outside [0, 1]",
                self.detection.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.detection.nms_iou_threshold) {
            return Err(PipelineError::Configuration(format!(
                "detection.nms_iou_threshold {} outside [0, 1]",
                self.detection.nms_iou_threshold
            )));
        }
        if self.calibration.table_length_m <= 0.0 || self.calibration.table_width_m <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "table dimensions must be positive, got {} x {}",
                self.calibration.table_length_m, self.calibration.table_width_m
            )));
        }
        if self.calibration.max_reprojection_error <= 0.0 {
            return Err(PipelineError::Configuration(
                "calibration.max_reprojection_error must be positive".into(),
            ));
        }
        if self.calibration.recalibration_interval == 0 {
            return Err(PipelineError::Configuration(
                "calibration.recalibration_interval must be positive".into(),
            ));
        }
        if self.tracking.max_tracking_distance <= 0.0 {
            return Err(PipelineError::Configuration(
                "tracking.max_tracking_distance must be positive".into(),
            ));
        }
        if self.tracking.max_disappeared_frames == 0 {
            return Err(PipelineError::Configuration(
                "tracking.max_disappeared_frames must be positive".into(),
            ));
        }
        if self.tracking.min_hits_to_activate == 0 {
            return Err(PipelineError::Configuration(
                "tracking.min_hits_to_activate must be positive".into(),
            ));
        }
        if self.tracking.kalman_process_noise <= 0.0 || self.tracking.kalman_measurement_noise <= 0.0
        {
            return Err(PipelineError::Configuration(
                "kalman noise parameters must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    use crate::types::*;
    Config {
        model: ModelConfig {
            path: "models/snooker.onnx".into(),
            fallback_path: None,
            input_size: 640,
        },
        detection: DetectionConfig {
            confidence_threshold: 0.2,
            nms_iou_threshold: 0.5,
        },
        calibration: CalibrationConfig {
            table_length_m: 3.569,
            table_width_m: 1.778,
            auto_recalibrate: true,
            recalibration_interval: 100,
            max_reprojection_error: 10.0,
            corner_shift_threshold: 50.0,
            max_failed_attempts: 5,
            cache_dir: None,
            camera_id: "test-cam".into(),
        },
        tracking: TrackingConfig {
            max_disappeared_frames: 10,
            max_tracking_distance: 50.0,
            min_hits_to_activate: 3,
            class_mismatch_penalty: 200.0,
            kalman_process_noise: 0.1,
            kalman_measurement_noise: 1.0,
            trajectory_smoothing: true,
        },
        video: VideoConfig {
            input_dir: "videos".into(),
            output_dir: "output".into(),
            save_annotated: false,
            drop_late_frames: false,
            frame_budget_ms: 33.0,
        },
        logging: LoggingConfig {
            level: "info".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_negative_table_dimensions_rejected() {
        let mut cfg = test_config();
        cfg.calibration.table_length_m = -1.0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_confidence_threshold_out_of_range_rejected() {
        let mut cfg = test_config();
        cfg.detection.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_disappeared_budget_rejected() {
        let mut cfg = test_config();
        cfg.tracking.max_disappeared_frames = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_model_path_rejected() {
        let mut cfg = test_config();
        cfg.model.path = String::new();
        assert!(cfg.validate().is_err());
    }
}
