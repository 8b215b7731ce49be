// src/calibration/engine.rs
//
// Table calibration from video frames. Corner detection runs the
// classic chain (grayscale -> blur -> Canny -> close -> Hough), the
// four cushion intersections feed the homography estimator, and the
// result is accepted only when the corner reprojection error is under
// the configured ceiling. A valid calibration is replaced wholesale on
// success and never mutated in place; failures leave the previous one
// serving until the failure budget demotes the session.

use crate::calibration::homography::{estimate_homography, mean_reprojection_error};
use crate::calibration::persistence::CalibrationCache;
use crate::calibration::render_rect_corners;
use crate::error::PipelineError;
use crate::types::{BoundingBox, CalibrationConfig, CalibrationData, Frame, Point};
use anyhow::Result;
use opencv::{
    core::{self, Mat, Vector},
    imgproc,
    prelude::*,
};
use std::f64::consts::PI;
use tracing::{debug, info, warn};

// Hough line classification and dedupe thresholds, in degrees / pixels.
const LINE_ANGLE_TOLERANCE_DEG: f64 = 20.0;
const LINE_RHO_DEDUPE_PX: f64 = 30.0;
const HOUGH_THRESHOLD: i32 = 100;

// Pocket extent as a fraction of the detected table bounding box.
const POCKET_FRACTION_X: f64 = 0.05;
const POCKET_FRACTION_Y: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    /// First calibration in progress, nothing valid yet.
    Calibrating,
    Calibrated,
    /// Valid calibration in service while a replacement is attempted.
    Recalibrating,
}

pub struct TableCalibrationEngine {
    config: CalibrationConfig,
    state: CalibrationState,
    current: Option<CalibrationData>,
    failed_attempts: u32,
    last_calibration_frame: Option<u64>,
    cache: Option<CalibrationCache>,
}

impl TableCalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        let cache = config.cache_dir.as_ref().map(CalibrationCache::new);

        // A cached calibration is a starting hypothesis only; it has
        // already been revalidated by the cache on load.
        let current = cache.as_ref().and_then(|c| c.load(&config.camera_id));
        let state = if current.is_some() {
            info!(camera_id = %config.camera_id, "starting from cached calibration");
            CalibrationState::Calibrated
        } else {
            CalibrationState::Uncalibrated
        };

        Self {
            config,
            state,
            current,
            failed_attempts: 0,
            last_calibration_frame: None,
            cache,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn current(&self) -> Option<&CalibrationData> {
        self.current.as_ref()
    }

    /// Recalibration policy: always when nothing valid exists, on the
    /// configured interval when auto-recalibration is enabled.
    pub fn needs_recalibration(&self, frame_number: u64) -> bool {
        if self.current.is_none() {
            return true;
        }
        if !self.config.auto_recalibrate {
            return false;
        }
        match self.last_calibration_frame {
            Some(last) => frame_number.saturating_sub(last) >= self.config.recalibration_interval,
            None => true,
        }
    }

    /// Mean corner displacement against the serving calibration; above
    /// the threshold the camera is assumed to have moved.
    pub fn camera_moved(&self, corners: &[Point; 4]) -> bool {
        let Some(current) = &self.current else {
            return false;
        };
        let mean_shift: f64 = current
            .table_corners
            .iter()
            .zip(corners)
            .map(|(a, b)| a.distance_to(b))
            .sum::<f64>()
            / 4.0;
        mean_shift > self.config.corner_shift_threshold
    }

    /// Run one calibration attempt against a frame. Returns whether a
    /// new calibration was installed. Detection misses count against
    /// the failure budget but are not errors.
    pub fn calibrate(&mut self, frame: &Frame, frame_number: u64) -> Result<bool> {
        self.state = if self.current.is_some() {
            CalibrationState::Recalibrating
        } else {
            CalibrationState::Calibrating
        };

        let corners = match self.detect_corners(frame)? {
            Some(corners) => corners,
            None => {
                debug!(frame = frame_number, "table corners not found");
                self.record_failure();
                return Ok(false);
            }
        };

        if self.camera_moved(&corners) {
            info!(frame = frame_number, "camera moved, replacing calibration");
        }

        match self.calibrate_from_corners(
            corners,
            (frame.width, frame.height),
            frame_number,
            frame.timestamp,
        ) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(frame = frame_number, error = %e, "calibration attempt rejected");
                Ok(false)
            }
        }
    }

    /// Calibrate from already-detected corners (ordered TL, TR, BR, BL).
    /// Split out from the image pipeline so geometry is testable without
    /// synthetic frames.
    pub fn calibrate_from_corners(
        &mut self,
        corners: [Point; 4],
        frame_size: (usize, usize),
        frame_number: u64,
        timestamp: f64,
    ) -> Result<(), PipelineError> {
        let dst = render_rect_corners((self.config.table_length_m, self.config.table_width_m));
        let homography = match estimate_homography(&corners, &dst) {
            Ok(h) => h,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };

        let error = mean_reprojection_error(&homography, &corners, &dst);
        if !error.is_finite() || error >= self.config.max_reprojection_error {
            self.record_failure();
            return Err(PipelineError::Calibration(format!(
                "reprojection error {error:.2}px exceeds limit {:.2}px",
                self.config.max_reprojection_error
            )));
        }

        let data = CalibrationData {
            homography,
            table_corners: corners,
            table_dimensions: (self.config.table_length_m, self.config.table_width_m),
            pocket_regions: generate_pocket_regions(&corners, frame_size),
            timestamp,
            is_valid: true,
            reprojection_error: error,
        };

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&self.config.camera_id, &data) {
                warn!(error = %e, "failed to cache calibration");
            }
        }

        info!(
            frame = frame_number,
            reprojection_error = error,
            "table calibration installed"
        );
        self.current = Some(data);
        self.state = CalibrationState::Calibrated;
        self.failed_attempts = 0;
        self.last_calibration_frame = Some(frame_number);
        Ok(())
    }

    fn record_failure(&mut self) {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.config.max_failed_attempts {
            if self.current.is_some() {
                warn!(
                    attempts = self.failed_attempts,
                    "calibration failure budget exhausted, demoting to uncalibrated"
                );
            }
            self.current = None;
            self.state = CalibrationState::Uncalibrated;
        } else if self.current.is_some() {
            self.state = CalibrationState::Calibrated;
        } else {
            self.state = CalibrationState::Calibrating;
        }
    }

    // ------------------------------------------------------------------
    // Corner detection
    // ------------------------------------------------------------------

    /// Detect the four cushion corners in a frame. `None` means the
    /// table geometry could not be established in this frame.
    fn detect_corners(&self, frame: &Frame) -> Result<Option<[Point; 4]>> {
        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(3, frame.height as i32)?;

        let mut gray = Mat::default();
        imgproc::cvt_color(&mat, &mut gray, imgproc::COLOR_RGB2GRAY, 0)?;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur(
            &gray,
            &mut blurred,
            core::Size::new(5, 5),
            0.0,
            0.0,
            core::BORDER_DEFAULT,
        )?;

        let mut edges = Mat::default();
        imgproc::canny(&blurred, &mut edges, 50.0, 150.0, 3, false)?;

        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            core::Size::new(3, 3),
            core::Point::new(-1, -1),
        )?;
        let mut closed = Mat::default();
        imgproc::morphology_ex(
            &edges,
            &mut closed,
            imgproc::MORPH_CLOSE,
            &kernel,
            core::Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut lines = Vector::<core::Vec2f>::new();
        imgproc::hough_lines(
            &closed,
            &mut lines,
            1.0,
            PI / 180.0,
            HOUGH_THRESHOLD,
            0.0,
            0.0,
            0.0,
            PI,
        )?;

        if lines.len() < 4 {
            debug!(lines = lines.len(), "not enough Hough lines for a table");
            return Ok(None);
        }

        let (horizontal, vertical) = classify_lines(&lines);
        if horizontal.len() < 2 || vertical.len() < 2 {
            debug!(
                horizontal = horizontal.len(),
                vertical = vertical.len(),
                "cushion lines incomplete"
            );
            return Ok(None);
        }

        let mut intersections = Vec::new();
        for &(h_rho, h_theta) in &horizontal {
            for &(v_rho, v_theta) in &vertical {
                if let Some(p) = line_intersection(h_rho, h_theta, v_rho, v_theta) {
                    // Allow a small margin outside the frame for cushions
                    // clipped by the image border.
                    if p.x > -50.0
                        && p.y > -50.0
                        && p.x < frame.width as f64 + 50.0
                        && p.y < frame.height as f64 + 50.0
                    {
                        intersections.push(p);
                    }
                }
            }
        }

        if intersections.len() < 4 {
            return Ok(None);
        }

        Ok(Some(order_corners(&intersections)))
    }
}

/// Split polar-form lines into near-horizontal and near-vertical groups,
/// then collapse near-duplicate rho values within each group.
fn classify_lines(lines: &Vector<core::Vec2f>) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    let mut horizontal = Vec::new();
    let mut vertical = Vec::new();

    for line in lines.iter() {
        let rho = line[0] as f64;
        let theta = line[1] as f64;
        let deg = theta.to_degrees();

        // theta near 0 or 180 is a vertical line in image space; theta
        // near 90 is horizontal.
        if deg < LINE_ANGLE_TOLERANCE_DEG || (180.0 - deg).abs() < LINE_ANGLE_TOLERANCE_DEG {
            vertical.push((rho, theta));
        } else if (deg - 90.0).abs() < LINE_ANGLE_TOLERANCE_DEG {
            horizontal.push((rho, theta));
        }
    }

    (dedupe_lines(horizontal), dedupe_lines(vertical))
}

fn dedupe_lines(mut lines: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    lines.sort_by(|a, b| {
        a.0.abs()
            .partial_cmp(&b.0.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut filtered: Vec<(f64, f64)> = Vec::new();
    for (rho, theta) in lines {
        if !filtered.iter().any(|(r, _)| (rho - r).abs() < LINE_RHO_DEDUPE_PX) {
            filtered.push((rho, theta));
        }
    }
    filtered
}

/// Intersection of two lines in polar form; None when near-parallel.
fn line_intersection(rho1: f64, theta1: f64, rho2: f64, theta2: f64) -> Option<Point> {
    let (c1, s1) = (theta1.cos(), theta1.sin());
    let (c2, s2) = (theta2.cos(), theta2.sin());

    let det = c1 * s2 - s1 * c2;
    if det.abs() < 1e-6 {
        return None;
    }

    let x = (s2 * rho1 - s1 * rho2) / det;
    let y = (c1 * rho2 - c2 * rho1) / det;
    Some(Point::new(x, y))
}

/// Pick the four extreme intersection points and order them TL, TR,
/// BR, BL. With image y pointing down, TL minimizes x+y and BL
/// minimizes x-y.
fn order_corners(points: &[Point]) -> [Point; 4] {
    let by_key = |key: fn(&Point) -> f64, max: bool| -> Point {
        let mut best = points[0];
        for p in points {
            let better = if max {
                key(p) > key(&best)
            } else {
                key(p) < key(&best)
            };
            if better {
                best = *p;
            }
        }
        best
    };

    let tl = by_key(|p| p.x + p.y, false);
    let br = by_key(|p| p.x + p.y, true);
    let tr = by_key(|p| p.x - p.y, true);
    let bl = by_key(|p| p.x - p.y, false);

    [tl, tr, br, bl]
}

/// Six pocket regions from the corner extent: four corners plus the two
/// midpoints of the long cushions, sized as a fraction of the table's
/// pixel footprint and clamped to the frame.
fn generate_pocket_regions(corners: &[Point; 4], frame_size: (usize, usize)) -> Vec<BoundingBox> {
    let min_x = corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

    let half_w = (max_x - min_x) * POCKET_FRACTION_X / 2.0;
    let half_h = (max_y - min_y) * POCKET_FRACTION_Y / 2.0;
    let mid_x = (min_x + max_x) / 2.0;

    let centers = [
        (min_x, min_y),
        (mid_x, min_y),
        (max_x, min_y),
        (min_x, max_y),
        (mid_x, max_y),
        (max_x, max_y),
    ];

    centers
        .iter()
        .map(|&(cx, cy)| {
            BoundingBox::new(
                (cx - half_w).max(0.0),
                (cy - half_h).max(0.0),
                (cx + half_w).min(frame_size.0 as f64),
                (cy + half_h).min(frame_size.1 as f64),
            )
        })
        .collect()
}
