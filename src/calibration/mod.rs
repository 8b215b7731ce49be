// src/calibration/mod.rs
//
// Table geometry: corner detection, homography estimation, coordinate
// transforms, and the calibration cache.

pub mod engine;
pub mod homography;
pub mod persistence;
pub mod transformer;

pub use engine::{CalibrationState, TableCalibrationEngine};
pub use persistence::CalibrationCache;
pub use transformer::CoordinateTransformer;

use crate::types::Point;

/// Width of the canonical table render rectangle the homography maps
/// onto. The height follows the physical aspect ratio.
pub const RENDER_WIDTH_PX: f64 = 800.0;

/// Corners of the canonical render rectangle (TL, TR, BR, BL) for a
/// table of the given (length, width) in meters.
pub fn render_rect_corners(table_dimensions: (f64, f64)) -> [Point; 4] {
    let (length_m, width_m) = table_dimensions;
    let height_px = RENDER_WIDTH_PX * width_m / length_m;
    [
        Point::new(0.0, 0.0),
        Point::new(RENDER_WIDTH_PX, 0.0),
        Point::new(RENDER_WIDTH_PX, height_px),
        Point::new(0.0, height_px),
    ]
}
