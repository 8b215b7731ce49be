// src/detection/validator.rs
//
// Detection hygiene: reject malformed raw detections before they reach
// the tracker, and suppress duplicate boxes per ball class. Invalid
// detections are dropped and logged, never propagated as errors.

use crate::types::{BallType, BoundingBox, Detection, NUM_BALL_CLASSES};
use tracing::debug;

/// Raw model output before validation, in original image coordinates.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2]
    pub class_id: usize,
    pub confidence: f32,
}

/// Validate raw detections into typed `Detection`s. Drops unknown class
/// ids, out-of-range confidences, and degenerate boxes.
pub fn validate(raw: Vec<RawDetection>, timestamp: f64) -> (Vec<Detection>, usize) {
    let mut valid = Vec::with_capacity(raw.len());
    let mut dropped = 0usize;

    for r in raw {
        let Some(ball_type) = BallType::from_class_id(r.class_id) else {
            debug!(class_id = r.class_id, "dropping detection with unknown class");
            dropped += 1;
            continue;
        };
        if !(0.0..=1.0).contains(&r.confidence) || r.confidence.is_nan() {
            debug!(confidence = r.confidence, "dropping detection with bad confidence");
            dropped += 1;
            continue;
        }
        let bbox = BoundingBox::new(
            r.bbox[0] as f64,
            r.bbox[1] as f64,
            r.bbox[2] as f64,
            r.bbox[3] as f64,
        );
        if !bbox.is_well_formed() {
            debug!(?bbox, "dropping detection with degenerate bbox");
            dropped += 1;
            continue;
        }

        valid.push(Detection {
            bbox,
            ball_type,
            confidence: r.confidence,
            timestamp,
        });
    }

    (valid, dropped)
}

/// Class-aware non-maximum suppression. Boxes only suppress boxes of the
/// same ball type; a red touching the black must survive.
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    let mut by_class: Vec<Vec<Detection>> = (0..NUM_BALL_CLASSES).map(|_| Vec::new()).collect();
    for det in detections {
        by_class[det.ball_type as usize].push(det);
    }

    let mut keep = Vec::new();
    for mut class_dets in by_class {
        class_dets.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        while !class_dets.is_empty() {
            let current = class_dets.remove(0);
            class_dets.retain(|det| iou(&current.bbox, &det.bbox) < iou_threshold);
            keep.push(current);
        }
    }

    keep
}

pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        (intersection / union) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bbox: [f32; 4], class_id: usize, confidence: f32) -> RawDetection {
        RawDetection {
            bbox,
            class_id,
            confidence,
        }
    }

    #[test]
    fn test_valid_detection_passes() {
        let (valid, dropped) = validate(vec![raw([10.0, 10.0, 30.0, 30.0], 1, 0.8)], 0.0);
        assert_eq!(valid.len(), 1);
        assert_eq!(dropped, 0);
        assert_eq!(valid[0].ball_type, BallType::Red);
    }

    #[test]
    fn test_unknown_class_dropped() {
        let (valid, dropped) = validate(vec![raw([10.0, 10.0, 30.0, 30.0], 12, 0.8)], 0.0);
        assert!(valid.is_empty());
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_bad_confidence_dropped() {
        let (valid, dropped) = validate(
            vec![
                raw([10.0, 10.0, 30.0, 30.0], 0, 1.5),
                raw([10.0, 10.0, 30.0, 30.0], 0, -0.1),
                raw([10.0, 10.0, 30.0, 30.0], 0, f32::NAN),
            ],
            0.0,
        );
        assert!(valid.is_empty());
        assert_eq!(dropped, 3);
    }

    #[test]
    fn test_degenerate_bbox_dropped() {
        let (valid, dropped) = validate(
            vec![
                raw([30.0, 10.0, 10.0, 30.0], 0, 0.8), // inverted x
                raw([10.0, 10.0, 10.0, 10.0], 0, 0.8), // zero area
            ],
            0.0,
        );
        assert!(valid.is_empty());
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let (dets, _) = validate(
            vec![
                raw([10.0, 10.0, 30.0, 30.0], 1, 0.9),
                raw([12.0, 12.0, 32.0, 32.0], 1, 0.6),
            ],
            0.0,
        );
        let kept = nms(dets, 0.5);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_cross_class_overlap() {
        // Red touching the black: same box region, different classes.
        let (dets, _) = validate(
            vec![
                raw([10.0, 10.0, 30.0, 30.0], 1, 0.9),
                raw([12.0, 12.0, 32.0, 32.0], 7, 0.8),
            ],
            0.0,
        );
        let kept = nms(dets, 0.5);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);
    }
}
