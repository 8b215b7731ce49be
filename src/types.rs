use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub calibration: CalibrationConfig,
    pub tracking: TrackingConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    /// Generic pretrained detector used when the custom model fails to load.
    pub fallback_path: Option<String>,
    pub input_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Physical table dimensions in meters (full-size snooker: 3.569 x 1.778).
    pub table_length_m: f64,
    pub table_width_m: f64,
    /// Recalibrate every N frames when auto_recalibrate is on.
    pub auto_recalibrate: bool,
    pub recalibration_interval: u64,
    /// Mean corner reprojection error (px) above which a homography is rejected.
    pub max_reprojection_error: f64,
    /// Mean corner displacement (px) that counts as a camera move.
    pub corner_shift_threshold: f64,
    /// Consecutive failures tolerated before a calibrated session is
    /// demoted back to uncalibrated.
    pub max_failed_attempts: u32,
    /// Disk cache for calibration, keyed by camera id. Disabled when unset.
    pub cache_dir: Option<String>,
    pub camera_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub max_disappeared_frames: u32,
    pub max_tracking_distance: f32,
    /// Consecutive hits required to promote Tentative -> Active.
    pub min_hits_to_activate: u32,
    /// Soft cost (px-equivalent) added when a tentative track is matched
    /// against a detection of a different ball type. Active tracks never
    /// match across types.
    pub class_mismatch_penalty: f32,
    pub kalman_process_noise: f64,
    pub kalman_measurement_noise: f64,
    /// Use the Kalman-filtered position for the trajectory instead of the
    /// raw detection centroid.
    pub trajectory_smoothing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
    pub save_annotated: bool,
    /// Live mode: drop frames that exceed the per-frame budget. Batch mode
    /// processes every frame to completion.
    pub drop_late_frames: bool,
    pub frame_budget_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// One decoded video frame, RGB, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub frame_number: u64,
    pub timestamp: f64,
}

// ============================================================================
// DOMAIN TYPES
// ============================================================================

pub const NUM_BALL_CLASSES: usize = 8;

/// The eight snooker ball classes, in model class-id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BallType {
    Cue,
    Red,
    Yellow,
    Green,
    Brown,
    Blue,
    Pink,
    Black,
}

impl BallType {
    pub fn from_class_id(class_id: usize) -> Option<Self> {
        match class_id {
            0 => Some(Self::Cue),
            1 => Some(Self::Red),
            2 => Some(Self::Yellow),
            3 => Some(Self::Green),
            4 => Some(Self::Brown),
            5 => Some(Self::Blue),
            6 => Some(Self::Pink),
            7 => Some(Self::Black),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cue => "cue",
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Brown => "brown",
            Self::Blue => "blue",
            Self::Pink => "pink",
            Self::Black => "black",
        }
    }

    /// How many balls of this type exist on a real table. Everything but
    /// the reds is a singleton slot.
    pub fn max_concurrent(&self) -> usize {
        match self {
            Self::Red => 15,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned pixel rectangle. Well-formed means x2 >= x1 and y2 >= y1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    pub fn area(&self) -> f64 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn is_well_formed(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.x2 >= self.x1
            && self.y2 >= self.y1
            && self.area() > 0.0
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }
}

/// One validated per-frame observation. Created fresh by the detection
/// engine every frame and absorbed into track history by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub ball_type: BallType,
    pub confidence: f32,
    pub timestamp: f64,
}

impl Detection {
    pub fn centroid(&self) -> Point {
        self.bbox.center()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    /// Newly created, not yet confirmed by enough consecutive hits.
    Tentative,
    /// Confirmed and matched recently.
    Active,
    /// Unmatched for a few frames but still within the disappearance budget.
    Occluded,
    /// Disappeared with its predicted position inside a pocket region.
    Potted,
    /// Disappeared elsewhere and exceeded the disappearance budget.
    Deleted,
}

impl TrackState {
    /// States that still participate in prediction and association.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Tentative | Self::Active | Self::Occluded)
    }
}

/// A tracked ball with its full trajectory history. Owned by the tracker;
/// handed out as immutable clones in each `FrameAnalysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedBall {
    pub track_id: u64,
    pub ball_type: BallType,
    pub current_position: Point,
    /// Current position mapped into table coordinates (meters), when a
    /// valid calibration exists.
    pub table_position: Option<Point>,
    pub trajectory: Vec<Point>,
    pub confidence_history: Vec<f32>,
    pub last_seen_frame: u64,
    pub state: TrackState,
    pub velocity: Point,
}

/// Table geometry calibration. Replaced wholesale on successful
/// recalibration, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Maps pixel coordinates to the canonical table rectangle (render px).
    pub homography: Matrix3<f64>,
    /// Ordered top-left, top-right, bottom-right, bottom-left.
    pub table_corners: [Point; 4],
    /// (length, width) in meters.
    pub table_dimensions: (f64, f64),
    /// Six pocket regions in pixel space.
    pub pocket_regions: Vec<BoundingBox>,
    pub timestamp: f64,
    pub is_valid: bool,
    /// Mean corner reprojection error in render px.
    pub reprojection_error: f64,
}

/// Immutable per-frame output snapshot, the unit handed to the API.
#[derive(Debug, Clone, Serialize)]
pub struct FrameAnalysis {
    pub frame_number: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub tracked_balls: Vec<TrackedBall>,
    pub calibration: Option<CalibrationData>,
    pub processing_time_ms: f64,
}

impl FrameAnalysis {
    pub fn active_tracks(&self) -> impl Iterator<Item = &TrackedBall> {
        self.tracked_balls
            .iter()
            .filter(|b| b.state == TrackState::Active)
    }
}
