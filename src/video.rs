// src/video.rs
//
// Video input handling: discover video files under the configured
// input directory and decode them into ordered RGB frames. Frame
// numbers and timestamps are strictly monotonic within one source;
// end-of-stream is an explicit `Ok(None)`.

use crate::types::{Frame, VideoConfig};
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTraitConst, VideoWriter},
};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

pub fn find_video_files(input_dir: &str) -> Result<Vec<PathBuf>> {
    let mut videos = Vec::new();

    for entry in WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
                videos.push(path.to_path_buf());
            }
        }
    }

    videos.sort();
    info!("Found {} video files in {}", videos.len(), input_dir);
    Ok(videos)
}

pub struct VideoSource {
    cap: VideoCapture,
    pub fps: f64,
    pub total_frames: i64,
    pub width: i32,
    pub height: i32,
    next_frame_number: u64,
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening video: {}", path.display());

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 video path: {}", path.display()))?;
        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)?;

        if !cap.is_opened()? {
            anyhow::bail!("failed to open video file {}", path.display());
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS)?;
        let total_frames = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)? as i64;
        let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(Self {
            cap,
            fps: if fps > 0.0 { fps } else { 30.0 },
            total_frames,
            width,
            height,
            next_frame_number: 0,
        })
    }

    /// Read the next frame as RGB. `Ok(None)` signals end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        use opencv::videoio::VideoCaptureTrait;

        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let mut rgb_mat = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB, 0)?;

        let frame_number = self.next_frame_number;
        self.next_frame_number += 1;

        // Dimensions come from the decoded Mat, not the capture
        // properties: some containers lie in their headers.
        Ok(Some(Frame {
            data: rgb_mat.data_bytes()?.to_vec(),
            width: rgb_mat.cols() as usize,
            height: rgb_mat.rows() as usize,
            frame_number,
            timestamp: frame_number as f64 / self.fps,
        }))
    }

    pub fn progress(&self) -> f32 {
        if self.total_frames <= 0 {
            return 0.0;
        }
        (self.next_frame_number as f32 / self.total_frames as f32) * 100.0
    }
}

/// Annotated-output writer for a source video, honoring
/// `video.save_annotated`.
pub fn create_writer(
    config: &VideoConfig,
    input_path: &Path,
    width: i32,
    height: i32,
    fps: f64,
) -> Result<Option<VideoWriter>> {
    if !config.save_annotated {
        return Ok(None);
    }

    std::fs::create_dir_all(&config.output_dir)?;

    let input_name = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let output_path =
        PathBuf::from(&config.output_dir).join(format!("{}_annotated.mp4", input_name));

    info!("Output video: {}", output_path.display());

    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let writer = VideoWriter::new(
        output_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 output path"))?,
        fourcc,
        fps,
        core::Size::new(width, height),
        true,
    )?;

    Ok(Some(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_video_files_filters_extensions() {
        let dir = std::env::temp_dir().join(format!("snooker-videos-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("nested")).unwrap();

        fs::write(dir.join("match.mp4"), b"").unwrap();
        fs::write(dir.join("frame147.MOV"), b"").unwrap();
        fs::write(dir.join("nested/break.avi"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();

        let videos = find_video_files(dir.to_str().unwrap()).unwrap();
        assert_eq!(videos.len(), 3);
        assert!(videos.iter().all(|p| p.extension().is_some()));
    }

    #[test]
    fn test_find_video_files_empty_dir() {
        let dir = std::env::temp_dir().join(format!("snooker-videos-empty-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        assert!(find_video_files(dir.to_str().unwrap()).unwrap().is_empty());
    }
}
