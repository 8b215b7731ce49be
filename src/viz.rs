// src/viz.rs
//
// Debug visualization: render a FrameAnalysis onto its frame as a BGR
// Mat ready for VideoWriter. Draws detections, table geometry, pocket
// regions, and per-track trajectories with ids.

use crate::types::{BallType, FrameAnalysis, Frame, TrackState};
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};

fn ball_color(ball_type: BallType) -> core::Scalar {
    // BGR, roughly the real ball colors.
    match ball_type {
        BallType::Cue => core::Scalar::new(255.0, 255.0, 255.0, 0.0),
        BallType::Red => core::Scalar::new(0.0, 0.0, 255.0, 0.0),
        BallType::Yellow => core::Scalar::new(0.0, 255.0, 255.0, 0.0),
        BallType::Green => core::Scalar::new(0.0, 200.0, 0.0, 0.0),
        BallType::Brown => core::Scalar::new(42.0, 42.0, 165.0, 0.0),
        BallType::Blue => core::Scalar::new(255.0, 0.0, 0.0, 0.0),
        BallType::Pink => core::Scalar::new(203.0, 192.0, 255.0, 0.0),
        BallType::Black => core::Scalar::new(40.0, 40.0, 40.0, 0.0),
    }
}

fn pocket_color() -> core::Scalar {
    core::Scalar::new(255.0, 0.0, 255.0, 0.0)
}

fn corner_color() -> core::Scalar {
    core::Scalar::new(0.0, 255.0, 0.0, 0.0)
}

const FONT: i32 = imgproc::FONT_HERSHEY_SIMPLEX;

/// Render analysis overlays onto the frame. Returns a BGR Mat.
pub fn annotate_frame(frame: &Frame, analysis: &FrameAnalysis) -> Result<Mat> {
    let mat = Mat::from_slice(&frame.data)?;
    let mat = mat.reshape(3, frame.height as i32)?;

    let mut output = Mat::default();
    imgproc::cvt_color(&mat, &mut output, imgproc::COLOR_RGB2BGR, 0)?;

    draw_calibration(&mut output, analysis)?;
    draw_detections(&mut output, analysis)?;
    draw_tracks(&mut output, analysis)?;
    draw_status(&mut output, analysis)?;

    Ok(output)
}

fn draw_calibration(output: &mut Mat, analysis: &FrameAnalysis) -> Result<()> {
    let Some(cal) = &analysis.calibration else {
        imgproc::put_text(
            output,
            "Table Not Calibrated",
            core::Point::new(20, 40),
            FONT,
            0.8,
            core::Scalar::new(0.0, 0.0, 255.0, 0.0),
            2,
            imgproc::LINE_AA,
            false,
        )?;
        return Ok(());
    };

    // Table boundary through the four corners.
    for i in 0..4 {
        let a = cal.table_corners[i];
        let b = cal.table_corners[(i + 1) % 4];
        imgproc::line(
            output,
            core::Point::new(a.x as i32, a.y as i32),
            core::Point::new(b.x as i32, b.y as i32),
            corner_color(),
            2,
            imgproc::LINE_AA,
            0,
        )?;
        imgproc::circle(
            output,
            core::Point::new(a.x as i32, a.y as i32),
            8,
            corner_color(),
            -1,
            imgproc::LINE_8,
            0,
        )?;
    }

    for (i, pocket) in cal.pocket_regions.iter().enumerate() {
        imgproc::rectangle(
            output,
            core::Rect::new(
                pocket.x1 as i32,
                pocket.y1 as i32,
                (pocket.x2 - pocket.x1) as i32,
                (pocket.y2 - pocket.y1) as i32,
            ),
            pocket_color(),
            2,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            output,
            &format!("P{}", i + 1),
            core::Point::new(pocket.x1 as i32, pocket.y1 as i32 - 5),
            FONT,
            0.4,
            pocket_color(),
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }

    Ok(())
}

fn draw_detections(output: &mut Mat, analysis: &FrameAnalysis) -> Result<()> {
    for det in &analysis.detections {
        let color = ball_color(det.ball_type);
        imgproc::rectangle(
            output,
            core::Rect::new(
                det.bbox.x1 as i32,
                det.bbox.y1 as i32,
                (det.bbox.x2 - det.bbox.x1) as i32,
                (det.bbox.y2 - det.bbox.y1) as i32,
            ),
            color,
            1,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            output,
            &format!("{} {:.2}", det.ball_type.name(), det.confidence),
            core::Point::new(det.bbox.x1 as i32, det.bbox.y1 as i32 - 4),
            FONT,
            0.4,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

fn draw_tracks(output: &mut Mat, analysis: &FrameAnalysis) -> Result<()> {
    for ball in &analysis.tracked_balls {
        if !ball.state.is_live() {
            continue;
        }
        let color = ball_color(ball.ball_type);

        for window in ball.trajectory.windows(2) {
            imgproc::line(
                output,
                core::Point::new(window[0].x as i32, window[0].y as i32),
                core::Point::new(window[1].x as i32, window[1].y as i32),
                color,
                2,
                imgproc::LINE_AA,
                0,
            )?;
        }

        let pos = core::Point::new(ball.current_position.x as i32, ball.current_position.y as i32);
        let marker = match ball.state {
            TrackState::Occluded => 3,
            _ => 5,
        };
        imgproc::circle(output, pos, marker, color, -1, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            output,
            &format!("#{}", ball.track_id),
            core::Point::new(pos.x + 8, pos.y - 8),
            FONT,
            0.45,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

fn draw_status(output: &mut Mat, analysis: &FrameAnalysis) -> Result<()> {
    let live = analysis
        .tracked_balls
        .iter()
        .filter(|b| b.state.is_live())
        .count();
    let status = format!(
        "frame {} | {} detections | {} tracks | {:.1} ms",
        analysis.frame_number,
        analysis.detections.len(),
        live,
        analysis.processing_time_ms
    );
    imgproc::put_text(
        output,
        &status,
        core::Point::new(20, 20),
        FONT,
        0.5,
        core::Scalar::new(255.0, 255.0, 255.0, 0.0),
        1,
        imgproc::LINE_AA,
        false,
    )?;
    Ok(())
}
