// src/calibration/transformer.rs
//
// Pixel <-> table coordinate conversion on top of a validated
// calibration. The homography maps camera pixels onto the canonical
// render rectangle; a linear scale then converts render px to meters.
// Stateless beyond the matrices captured at construction.

use crate::calibration::homography;
use crate::calibration::RENDER_WIDTH_PX;
use crate::error::PipelineError;
use crate::types::{CalibrationData, Point};
use nalgebra::Matrix3;

#[derive(Debug)]
pub struct CoordinateTransformer {
    homography: Matrix3<f64>,
    inverse: Matrix3<f64>,
    /// Meters per canonical render pixel, along both axes.
    meters_per_px: f64,
}

impl CoordinateTransformer {
    /// Build a transformer from calibration data. Refuses invalid
    /// calibrations outright; callers fall back to pixel-space output.
    pub fn new(calibration: &CalibrationData) -> Result<Self, PipelineError> {
        if !calibration.is_valid {
            return Err(PipelineError::Coordinate(
                "cannot transform coordinates without a valid calibration".into(),
            ));
        }

        let inverse = calibration.homography.try_inverse().ok_or_else(|| {
            PipelineError::Coordinate("calibration homography is singular".into())
        })?;

        let (length_m, _) = calibration.table_dimensions;
        Ok(Self {
            homography: calibration.homography,
            inverse,
            meters_per_px: length_m / RENDER_WIDTH_PX,
        })
    }

    /// Camera pixel -> table position in meters, origin at the top-left
    /// pocket, x along the long cushion.
    pub fn pixel_to_table(&self, p: Point) -> Result<Point, PipelineError> {
        let render = homography::project(&self.homography, p);
        if !render.x.is_finite() || !render.y.is_finite() {
            return Err(PipelineError::Coordinate(format!(
                "point ({}, {}) projects to infinity",
                p.x, p.y
            )));
        }
        Ok(Point::new(
            render.x * self.meters_per_px,
            render.y * self.meters_per_px,
        ))
    }

    /// Table position in meters -> camera pixel.
    pub fn table_to_pixel(&self, p: Point) -> Result<Point, PipelineError> {
        let render = Point::new(p.x / self.meters_per_px, p.y / self.meters_per_px);
        let pixel = homography::project(&self.inverse, render);
        if !pixel.x.is_finite() || !pixel.y.is_finite() {
            return Err(PipelineError::Coordinate(format!(
                "table point ({}, {}) has no pixel preimage",
                p.x, p.y
            )));
        }
        Ok(pixel)
    }

    pub fn transform_trajectory(&self, trajectory: &[Point]) -> Result<Vec<Point>, PipelineError> {
        trajectory.iter().map(|p| self.pixel_to_table(*p)).collect()
    }
}
