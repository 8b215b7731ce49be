// src/main.rs

mod calibration;
mod config;
mod detection;
mod error;
mod pipeline;
mod tracking;
mod types;
mod video;
mod viz;

use anyhow::Result;
use opencv::videoio::VideoWriterTrait;
use pipeline::FrameProcessor;
use std::path::Path;
use tracing::{error, info, warn};
use types::Config;

fn main() -> Result<()> {
    let config = Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("snooker_vision={},ort=warn", config.logging.level))
        .init();

    info!("🎱 Snooker Ball Detection System Starting");
    info!("✓ Configuration loaded");
    info!(
        "Detection thresholds: confidence={:.2}, nms_iou={:.2}",
        config.detection.confidence_threshold, config.detection.nms_iou_threshold
    );
    info!(
        "Table: {:.3}m x {:.3}m, recalibrate every {} frames",
        config.calibration.table_length_m,
        config.calibration.table_width_m,
        config.calibration.recalibration_interval
    );

    let video_files = video::find_video_files(&config.video.input_dir)?;
    if video_files.is_empty() {
        error!("No video files found in {}", config.video.input_dir);
        return Ok(());
    }

    for path in &video_files {
        if let Err(e) = process_video(path, &config) {
            // One bad file must not end the batch.
            error!("Failed to process {}: {:#}", path.display(), e);
        }
    }

    info!("All videos processed");
    Ok(())
}

/// Run one video through an independent session.
fn process_video(path: &Path, config: &Config) -> Result<()> {
    let mut source = video::VideoSource::open(path)?;
    let mut writer = video::create_writer(
        &config.video,
        path,
        source.width,
        source.height,
        source.fps,
    )?;

    let (mut processor, _api) = FrameProcessor::new(config.clone())?;

    while let Some(frame) = source.read_frame()? {
        let Some(analysis) = processor.process_frame(&frame) else {
            continue;
        };

        if let Some(writer) = writer.as_mut() {
            match viz::annotate_frame(&frame, &analysis) {
                Ok(annotated) => writer.write(&annotated)?,
                Err(e) => warn!(frame = frame.frame_number, error = %e, "annotation failed"),
            }
        }

        if frame.frame_number % 100 == 0 && frame.frame_number > 0 {
            info!(
                "Progress: {:.1}% | {} active tracks | {:.1} ms/frame",
                source.progress(),
                analysis.active_tracks().count(),
                processor.stats().mean_processing_ms()
            );
        }
    }

    let stats = processor.stats();
    let det_stats = processor.detection_engine().stats();
    let track_stats = processor.tracker().stats();

    info!("===========================================");
    info!("Session complete: {}", path.display());
    info!(
        "  Frames: {} processed, {} dropped, {:.1} ms mean",
        stats.frames_processed,
        stats.frames_dropped,
        stats.mean_processing_ms()
    );
    info!(
        "  Detections: {} total, {} invalid dropped, {} malformed frames, mean confidence {:.2}",
        det_stats.total_detections,
        det_stats.dropped_invalid,
        det_stats.malformed_frames,
        det_stats.mean_confidence
    );
    info!(
        "  Tracks: {} created, {} potted, {} deleted",
        track_stats.tracks_created, track_stats.tracks_potted, track_stats.tracks_deleted
    );
    info!("  Calibration failures: {}", stats.calibration_failures);
    info!("===========================================");

    Ok(())
}
