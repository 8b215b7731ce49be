// src/tracking/tracker.rs
//
// Multi-object ball tracker: Kalman prediction + Hungarian association
// with an explicit per-track lifecycle.
//
//   Tentative -> Active      after min_hits_to_activate consecutive matches
//   Active    -> Occluded    on the first missed frame
//   Occluded  -> Active      on re-association
//   live      -> Potted      budget exhausted with the predicted position
//                            inside a pocket region
//   live      -> Deleted     budget exhausted anywhere else
//
// Potted and Deleted are terminal; the trajectory is frozen and the
// track is emitted one last time before being dropped.

use crate::tracking::hungarian;
use crate::tracking::kalman::PositionFilter;
use crate::types::{
    BallType, BoundingBox, Detection, Point, TrackState, TrackedBall, TrackingConfig,
};
use tracing::{debug, warn};

// ============================================================================
// INTERNAL TRACK STATE
// ============================================================================

struct Track {
    id: u64,
    ball_type: BallType,
    filter: PositionFilter,
    trajectory: Vec<Point>,
    confidence_history: Vec<f32>,
    state: TrackState,
    /// Consecutive matched frames; resets on a miss while Tentative.
    hits: u32,
    frames_since_seen: u32,
    last_seen_frame: u64,
    /// Kalman prediction for the current frame, refreshed every update().
    predicted: Point,
}

impl Track {
    fn snapshot(&self) -> TrackedBall {
        TrackedBall {
            track_id: self.id,
            ball_type: self.ball_type,
            current_position: self.filter.position(),
            table_position: None,
            trajectory: self.trajectory.clone(),
            confidence_history: self.confidence_history.clone(),
            last_seen_frame: self.last_seen_frame,
            state: self.state,
            velocity: self.filter.velocity(),
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingStats {
    pub tracks_created: u64,
    pub tracks_deleted: u64,
    pub tracks_potted: u64,
    pub greedy_fallbacks: u64,
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct BallTracker {
    config: TrackingConfig,
    tracks: Vec<Track>,
    next_id: u64,
    stats: TrackingStats,
}

impl BallTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 0,
            stats: TrackingStats::default(),
        }
    }

    pub fn stats(&self) -> TrackingStats {
        self.stats
    }

    /// Number of tracks still participating in association.
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.state.is_live()).count()
    }

    /// Run one frame of the track/update cycle. `pockets` come from the
    /// current calibration and may be empty when uncalibrated; without
    /// pockets every expired track is Deleted rather than Potted.
    ///
    /// Returns a snapshot of every track touched this frame, including
    /// tracks that just reached a terminal state.
    pub fn update(
        &mut self,
        detections: &[Detection],
        frame_number: u64,
        pockets: &[BoundingBox],
    ) -> Vec<TrackedBall> {
        for track in &mut self.tracks {
            track.predicted = track.filter.predict();
        }

        let assignment = self.associate(detections);

        let mut detection_used = vec![false; detections.len()];
        for (track_idx, det_idx) in assignment.iter().enumerate() {
            if let Some(di) = *det_idx {
                detection_used[di] = true;
                self.apply_match(track_idx, &detections[di], frame_number);
            }
        }

        // Promotions after all matches land so the slot census sees the
        // whole frame at once.
        self.promote_tentatives();

        let unmatched: Vec<usize> = assignment
            .iter()
            .enumerate()
            .filter(|(i, d)| d.is_none() && self.tracks[*i].state.is_live())
            .map(|(i, _)| i)
            .collect();
        for track_idx in unmatched {
            self.apply_miss(track_idx, pockets);
        }

        for (di, det) in detections.iter().enumerate() {
            if !detection_used[di] {
                self.spawn_track(det, frame_number);
            }
        }

        let output: Vec<TrackedBall> = self.tracks.iter().map(Track::snapshot).collect();
        self.tracks.retain(|t| t.state.is_live());
        output
    }

    // ------------------------------------------------------------------
    // Association
    // ------------------------------------------------------------------

    /// Distance + class compatibility cost for one track/detection pair.
    /// Infinity marks pairs the association must never produce. The
    /// confidence term is too small to override any real distance gap;
    /// it only breaks equal-distance ties toward the more confident
    /// detection, the same order the greedy fallback uses.
    fn pair_cost(&self, track: &Track, det: &Detection) -> f32 {
        const CONFIDENCE_TIEBREAK: f32 = 1e-3;

        let dist = track.predicted.distance_to(&det.centroid()) as f32;
        if dist > self.config.max_tracking_distance {
            return f32::INFINITY;
        }
        let base = dist + (1.0 - det.confidence) * CONFIDENCE_TIEBREAK;
        if track.ball_type == det.ball_type {
            return base;
        }
        match track.state {
            // A tentative track's class is still uncertain; allow the
            // cross-type match at a steep cost.
            TrackState::Tentative => base + self.config.class_mismatch_penalty,
            _ => f32::INFINITY,
        }
    }

    /// Returns, per track, the index of the matched detection. Terminal
    /// tracks never match.
    fn associate(&mut self, detections: &[Detection]) -> Vec<Option<usize>> {
        if self.tracks.is_empty() || detections.is_empty() {
            return vec![None; self.tracks.len()];
        }

        let cost: Vec<Vec<f32>> = self
            .tracks
            .iter()
            .map(|t| {
                detections
                    .iter()
                    .map(|d| {
                        if t.state.is_live() {
                            self.pair_cost(t, d)
                        } else {
                            f32::INFINITY
                        }
                    })
                    .collect()
            })
            .collect();

        match hungarian::solve(&cost) {
            Ok(assignment) => assignment,
            Err(e) => {
                self.stats.greedy_fallbacks += 1;
                warn!(error = %e, "assignment solver failed, using greedy matching for this frame");
                self.greedy_associate(&cost, detections)
            }
        }
    }

    /// Per-frame fallback when the optimal solver rejects the matrix.
    /// Ties break on matching ball type, then higher confidence, then
    /// smaller distance, matching the solver's preference order.
    fn greedy_associate(
        &self,
        cost: &[Vec<f32>],
        detections: &[Detection],
    ) -> Vec<Option<usize>> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, row) in cost.iter().enumerate() {
            for (di, &c) in row.iter().enumerate() {
                if c.is_finite() {
                    pairs.push((c, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_match = self.tracks[a.1].ball_type == detections[a.2].ball_type;
                    let b_match = self.tracks[b.1].ball_type == detections[b.2].ball_type;
                    b_match.cmp(&a_match)
                })
                .then_with(|| {
                    detections[b.2]
                        .confidence
                        .partial_cmp(&detections[a.2].confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        let mut assignment = vec![None; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        for (_, ti, di) in pairs {
            if assignment[ti].is_none() && !det_taken[di] {
                assignment[ti] = Some(di);
                det_taken[di] = true;
            }
        }
        assignment
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    fn apply_match(&mut self, track_idx: usize, det: &Detection, frame_number: u64) {
        let smoothing = self.config.trajectory_smoothing;
        let track = &mut self.tracks[track_idx];

        let corrected = track.filter.update(det.centroid());
        let point = if smoothing { corrected } else { det.centroid() };
        track.trajectory.push(point);
        track.confidence_history.push(det.confidence);
        track.hits += 1;
        track.frames_since_seen = 0;
        track.last_seen_frame = frame_number;

        match track.state {
            TrackState::Occluded => {
                debug!(track_id = track.id, "track recovered from occlusion");
                track.state = TrackState::Active;
            }
            TrackState::Tentative => {
                // The class can still be corrected while tentative.
                if track.ball_type != det.ball_type {
                    track.ball_type = det.ball_type;
                }
            }
            _ => {}
        }
    }

    /// Tentative -> Active once the hit debounce is satisfied and the
    /// ball-type slot census allows another track of that type.
    fn promote_tentatives(&mut self) {
        let candidates: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.state == TrackState::Tentative && t.hits >= self.config.min_hits_to_activate
            })
            .map(|(i, _)| i)
            .collect();

        for idx in candidates {
            let ball_type = self.tracks[idx].ball_type;
            let confirmed_of_type = self
                .tracks
                .iter()
                .filter(|t| {
                    t.ball_type == ball_type
                        && matches!(t.state, TrackState::Active | TrackState::Occluded)
                })
                .count();
            if confirmed_of_type < ball_type.max_concurrent() {
                debug!(
                    track_id = self.tracks[idx].id,
                    ball = ball_type.name(),
                    "track activated"
                );
                self.tracks[idx].state = TrackState::Active;
            }
            // Slot full: stay Tentative. The usual cause is a duplicate
            // detection of a ball that already has an active track, and
            // those starve out within the disappearance budget.
        }
    }

    fn apply_miss(&mut self, track_idx: usize, pockets: &[BoundingBox]) {
        let max_disappeared = self.config.max_disappeared_frames;
        let track = &mut self.tracks[track_idx];

        track.frames_since_seen += 1;
        track.hits = 0;

        if track.frames_since_seen >= max_disappeared {
            let in_pocket = pockets.iter().any(|p| p.contains(&track.predicted));
            if in_pocket {
                debug!(
                    track_id = track.id,
                    ball = track.ball_type.name(),
                    "track potted"
                );
                track.state = TrackState::Potted;
                self.stats.tracks_potted += 1;
            } else {
                debug!(track_id = track.id, "track deleted after disappearance");
                track.state = TrackState::Deleted;
                self.stats.tracks_deleted += 1;
            }
        } else if track.state == TrackState::Active {
            track.state = TrackState::Occluded;
        }
    }

    fn spawn_track(&mut self, det: &Detection, frame_number: u64) {
        let centroid = det.centroid();
        let filter = PositionFilter::new(
            centroid,
            self.config.kalman_process_noise,
            self.config.kalman_measurement_noise,
        );

        let track = Track {
            id: self.next_id,
            ball_type: det.ball_type,
            filter,
            trajectory: vec![centroid],
            confidence_history: vec![det.confidence],
            state: TrackState::Tentative,
            hits: 1,
            frames_since_seen: 0,
            last_seen_frame: frame_number,
            predicted: centroid,
        };
        debug!(
            track_id = track.id,
            ball = det.ball_type.name(),
            x = centroid.x,
            y = centroid.y,
            "new tentative track"
        );
        self.next_id += 1;
        self.stats.tracks_created += 1;
        self.tracks.push(track);
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TrackingConfig {
        TrackingConfig {
            max_disappeared_frames: 10,
            max_tracking_distance: 50.0,
            min_hits_to_activate: 3,
            class_mismatch_penalty: 200.0,
            kalman_process_noise: 0.1,
            kalman_measurement_noise: 1.0,
            trajectory_smoothing: true,
        }
    }

    fn det(x: f64, y: f64, ball_type: BallType) -> Detection {
        Detection {
            bbox: BoundingBox::new(x - 5.0, y - 5.0, x + 5.0, y + 5.0),
            ball_type,
            confidence: 0.9,
            timestamp: 0.0,
        }
    }

    #[test]
    fn test_single_ball_three_frame_trajectory() {
        let mut tracker = BallTracker::new(test_config());

        tracker.update(&[det(100.0, 100.0, BallType::Red)], 0, &[]);
        tracker.update(&[det(110.0, 100.0, BallType::Red)], 1, &[]);
        let balls = tracker.update(&[det(120.0, 100.0, BallType::Red)], 2, &[]);

        assert_eq!(balls.len(), 1);
        let ball = &balls[0];
        assert_eq!(ball.track_id, 0);
        assert_eq!(ball.state, TrackState::Active);
        assert_eq!(ball.trajectory.len(), 3);

        let expected = [(100.0, 100.0), (110.0, 100.0), (120.0, 100.0)];
        for (p, (ex, ey)) in ball.trajectory.iter().zip(expected) {
            assert!((p.x - ex).abs() < 0.5, "x = {}, expected {}", p.x, ex);
            assert!((p.y - ey).abs() < 0.5, "y = {}, expected {}", p.y, ey);
        }
    }

    #[test]
    fn test_disappearance_away_from_pockets_deletes() {
        let mut cfg = test_config();
        cfg.max_disappeared_frames = 3;
        let mut tracker = BallTracker::new(cfg);

        // Table-center ball, no pocket anywhere near.
        for f in 0..3 {
            tracker.update(&[det(500.0, 300.0, BallType::Blue)], f, &[]);
        }

        let pockets = [BoundingBox::new(0.0, 0.0, 40.0, 40.0)];
        let mut last = Vec::new();
        for f in 3..6 {
            last = tracker.update(&[], f, &pockets);
        }

        let deleted = last.iter().find(|b| b.track_id == 0).unwrap();
        assert_eq!(deleted.state, TrackState::Deleted);
        assert_eq!(tracker.live_track_count(), 0);
        assert_eq!(tracker.stats().tracks_deleted, 1);
    }

    #[test]
    fn test_disappearance_inside_pocket_pots() {
        let mut cfg = test_config();
        cfg.max_disappeared_frames = 3;
        let mut tracker = BallTracker::new(cfg);

        let pockets = [BoundingBox::new(480.0, 280.0, 540.0, 340.0)];
        for f in 0..3 {
            tracker.update(&[det(500.0, 300.0, BallType::Red)], f, &pockets);
        }

        let mut last = Vec::new();
        for f in 3..6 {
            last = tracker.update(&[], f, &pockets);
        }

        let potted = last.iter().find(|b| b.track_id == 0).unwrap();
        assert_eq!(potted.state, TrackState::Potted);
        assert_eq!(tracker.stats().tracks_potted, 1);
    }

    #[test]
    fn test_budget_boundary_does_not_delete_early() {
        let mut cfg = test_config();
        cfg.max_disappeared_frames = 3;
        let mut tracker = BallTracker::new(cfg);

        for f in 0..3 {
            tracker.update(&[det(500.0, 300.0, BallType::Red)], f, &[]);
        }

        // Exactly max_disappeared - 1 absences: track must still be live.
        tracker.update(&[], 3, &[]);
        let balls = tracker.update(&[], 4, &[]);
        let ball = balls.iter().find(|b| b.track_id == 0).unwrap();
        assert_eq!(ball.state, TrackState::Occluded);
        assert_eq!(tracker.live_track_count(), 1);
    }

    #[test]
    fn test_occluded_track_recovers_with_same_id() {
        let mut tracker = BallTracker::new(test_config());

        for f in 0..3 {
            tracker.update(&[det(100.0 + 5.0 * f as f64, 100.0, BallType::Red)], f, &[]);
        }
        tracker.update(&[], 3, &[]);
        tracker.update(&[], 4, &[]);

        let balls = tracker.update(&[det(125.0, 100.0, BallType::Red)], 5, &[]);
        let live: Vec<_> = balls.iter().filter(|b| b.state.is_live()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].track_id, 0);
        assert_eq!(live[0].state, TrackState::Active);
    }

    #[test]
    fn test_active_track_never_matches_other_type() {
        let mut tracker = BallTracker::new(test_config());

        for f in 0..3 {
            tracker.update(&[det(100.0, 100.0, BallType::Red)], f, &[]);
        }

        // A black ball appears right on top of the red track's prediction.
        let balls = tracker.update(&[det(101.0, 100.0, BallType::Black)], 3, &[]);
        let red = balls.iter().find(|b| b.ball_type == BallType::Red).unwrap();
        let black = balls.iter().find(|b| b.ball_type == BallType::Black).unwrap();

        assert_eq!(red.state, TrackState::Occluded);
        assert_eq!(black.state, TrackState::Tentative);
        assert_ne!(red.track_id, black.track_id);
    }

    #[test]
    fn test_single_slot_per_non_red_type() {
        let mut tracker = BallTracker::new(test_config());

        // Two well-separated "cue" detections every frame; only one may
        // hold the Active cue slot.
        for f in 0..5 {
            tracker.update(
                &[det(100.0, 100.0, BallType::Cue), det(400.0, 300.0, BallType::Cue)],
                f,
                &[],
            );
        }

        let balls = tracker.update(
            &[det(100.0, 100.0, BallType::Cue), det(400.0, 300.0, BallType::Cue)],
            5,
            &[],
        );
        let active = balls
            .iter()
            .filter(|b| b.ball_type == BallType::Cue && b.state == TrackState::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_multiple_red_tracks_allowed() {
        let mut tracker = BallTracker::new(test_config());

        for f in 0..4 {
            tracker.update(
                &[det(100.0, 100.0, BallType::Red), det(400.0, 300.0, BallType::Red)],
                f,
                &[],
            );
        }
        let balls = tracker.update(
            &[det(100.0, 100.0, BallType::Red), det(400.0, 300.0, BallType::Red)],
            4,
            &[],
        );
        let active = balls.iter().filter(|b| b.state == TrackState::Active).count();
        assert_eq!(active, 2);
    }

    #[test]
    fn test_track_ids_monotone_and_never_reused() {
        let mut cfg = test_config();
        cfg.max_disappeared_frames = 2;
        let mut tracker = BallTracker::new(cfg);

        tracker.update(&[det(100.0, 100.0, BallType::Red)], 0, &[]);
        tracker.update(&[], 1, &[]);
        tracker.update(&[], 2, &[]);
        assert_eq!(tracker.live_track_count(), 0);

        // Same spot again: fresh id, not a resurrection of track 0.
        let balls = tracker.update(&[det(100.0, 100.0, BallType::Red)], 3, &[]);
        let live: Vec<_> = balls.iter().filter(|b| b.state.is_live()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].track_id, 1);
    }

    #[test]
    fn test_equidistant_candidates_resolve_by_confidence() {
        let mut tracker = BallTracker::new(test_config());

        // Stationary ball: the prediction stays exactly at (100, 100).
        for f in 0..3 {
            tracker.update(&[det(100.0, 100.0, BallType::Red)], f, &[]);
        }

        // Two reds at equal distance from the prediction; the track must
        // follow the more confident one, not whichever the solver
        // happens to visit first.
        let mut weak = det(92.0, 100.0, BallType::Red);
        weak.confidence = 0.4;
        let strong = det(108.0, 100.0, BallType::Red);

        let balls = tracker.update(&[weak, strong], 3, &[]);
        let followed = balls.iter().find(|b| b.track_id == 0).unwrap();
        assert!(
            followed.trajectory.last().unwrap().x > 100.0,
            "track followed the low-confidence candidate"
        );
        // The weaker detection spawns its own tentative track.
        assert!(balls
            .iter()
            .any(|b| b.state == TrackState::Tentative && b.current_position.x < 100.0));
    }

    #[test]
    fn test_nan_detection_falls_back_to_greedy() {
        let mut tracker = BallTracker::new(test_config());
        tracker.update(&[det(100.0, 100.0, BallType::Red)], 0, &[]);

        let mut bad = det(f64::NAN, 100.0, BallType::Red);
        bad.bbox = BoundingBox::new(f64::NAN, 95.0, f64::NAN, 105.0);
        let good = det(102.0, 100.0, BallType::Red);

        // Must not panic and must keep the good detection flowing.
        let balls = tracker.update(&[bad, good], 1, &[]);
        assert_eq!(tracker.stats().greedy_fallbacks, 1);
        assert!(balls.iter().any(|b| b.track_id == 0 && b.trajectory.len() == 2));
    }

    #[test]
    fn test_trajectory_frozen_after_terminal_state() {
        let mut cfg = test_config();
        cfg.max_disappeared_frames = 2;
        let mut tracker = BallTracker::new(cfg);

        for f in 0..3 {
            tracker.update(&[det(100.0, 100.0, BallType::Red)], f, &[]);
        }
        let last = tracker.update(&[], 3, &[]);
        let final_len = last[0].trajectory.len();
        let last = tracker.update(&[], 4, &[]);
        assert_eq!(last[0].state, TrackState::Deleted);
        assert_eq!(last[0].trajectory.len(), final_len);
    }
}
