// src/pipeline/api.rs
//
// Outward-facing detection API for one session. The processor publishes
// each finished FrameAnalysis as an immutable Arc snapshot; consumers
// read the latest without ever blocking the pipeline, or drain the
// ordered stream. One publisher, many readers.

use crate::types::{CalibrationData, FrameAnalysis};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

struct Shared {
    latest: RwLock<Option<Arc<FrameAnalysis>>>,
    calibration: RwLock<Option<Arc<CalibrationData>>>,
    stream_claimed: AtomicBool,
}

/// Write half, owned by the frame processor.
pub struct AnalysisPublisher {
    shared: Arc<Shared>,
    stream: Sender<Arc<FrameAnalysis>>,
}

/// Read half, freely cloneable across consumer threads.
#[derive(Clone)]
pub struct DetectionApi {
    shared: Arc<Shared>,
    stream: Arc<Mutex<Option<Receiver<Arc<FrameAnalysis>>>>>,
}

/// Create a connected publisher/API pair for a session.
pub fn channel() -> (AnalysisPublisher, DetectionApi) {
    let shared = Arc::new(Shared {
        latest: RwLock::new(None),
        calibration: RwLock::new(None),
        stream_claimed: AtomicBool::new(false),
    });
    let (tx, rx) = unbounded();

    (
        AnalysisPublisher {
            shared: Arc::clone(&shared),
            stream: tx,
        },
        DetectionApi {
            shared,
            stream: Arc::new(Mutex::new(Some(rx))),
        },
    )
}

impl AnalysisPublisher {
    /// Publish one frame's analysis. Replaces the latest snapshot and,
    /// once a consumer has claimed the stream, appends to it; never
    /// blocks. Frames published before the claim are not buffered, so
    /// an unconsumed session accumulates nothing.
    pub fn publish(&self, analysis: FrameAnalysis) -> Arc<FrameAnalysis> {
        let snapshot = Arc::new(analysis);

        if let Some(cal) = &snapshot.calibration {
            if let Ok(mut guard) = self.shared.calibration.write() {
                *guard = Some(Arc::new(cal.clone()));
            }
        }

        if let Ok(mut guard) = self.shared.latest.write() {
            *guard = Some(Arc::clone(&snapshot));
        }

        // Stream consumers may have hung up; latest-snapshot access
        // keeps working regardless.
        if self.shared.stream_claimed.load(Ordering::Acquire)
            && self.stream.send(Arc::clone(&snapshot)).is_err()
        {
            debug!("analysis stream has no consumers");
        }
        snapshot
    }
}

impl DetectionApi {
    /// Most recently published analysis, if any frame has completed.
    pub fn latest(&self) -> Option<Arc<FrameAnalysis>> {
        self.shared.latest.read().ok()?.clone()
    }

    /// Most recent valid calibration seen on any published frame.
    pub fn calibration(&self) -> Option<Arc<CalibrationData>> {
        self.shared.calibration.read().ok()?.clone()
    }

    /// Claim the ordered analysis stream. One consumer only; the stream
    /// starts at the claim and is not restartable mid-session.
    pub fn take_stream(&self) -> Option<Receiver<Arc<FrameAnalysis>>> {
        let rx = self.stream.lock().ok()?.take()?;
        self.shared.stream_claimed.store(true, Ordering::Release);
        Some(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(frame_number: u64) -> FrameAnalysis {
        FrameAnalysis {
            frame_number,
            timestamp: frame_number as f64 / 30.0,
            detections: Vec::new(),
            tracked_balls: Vec::new(),
            calibration: None,
            processing_time_ms: 1.0,
        }
    }

    #[test]
    fn test_latest_replaced_per_publish() {
        let (publisher, api) = channel();
        assert!(api.latest().is_none());

        publisher.publish(analysis(0));
        publisher.publish(analysis(1));

        assert_eq!(api.latest().unwrap().frame_number, 1);
    }

    #[test]
    fn test_stream_is_ordered_and_complete() {
        let (publisher, api) = channel();
        let rx = api.take_stream().unwrap();

        for f in 0..5 {
            publisher.publish(analysis(f));
        }
        drop(publisher);

        let frames: Vec<u64> = rx.iter().map(|a| a.frame_number).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_calibration_survives_uncalibrated_frames() {
        let (publisher, api) = channel();

        let mut with_cal = analysis(0);
        with_cal.calibration = Some(CalibrationData {
            homography: nalgebra::Matrix3::identity(),
            table_corners: [crate::types::Point::new(0.0, 0.0); 4],
            table_dimensions: (3.569, 1.778),
            pocket_regions: Vec::new(),
            timestamp: 0.0,
            is_valid: true,
            reprojection_error: 0.1,
        });
        publisher.publish(with_cal);
        publisher.publish(analysis(1)); // no calibration on this frame

        assert!(api.calibration().is_some());
        assert!(api.latest().unwrap().calibration.is_none());
    }

    #[test]
    fn test_stream_claimable_once() {
        let (_publisher, api) = channel();
        assert!(api.take_stream().is_some());
        assert!(api.take_stream().is_none());
    }

    #[test]
    fn test_unclaimed_stream_buffers_nothing() {
        let (publisher, api) = channel();

        // Nobody has claimed the stream; these must not accumulate.
        publisher.publish(analysis(0));
        publisher.publish(analysis(1));

        let rx = api.take_stream().unwrap();
        publisher.publish(analysis(2));
        drop(publisher);

        let frames: Vec<u64> = rx.iter().map(|a| a.frame_number).collect();
        assert_eq!(frames, vec![2]);
        assert_eq!(api.latest().unwrap().frame_number, 2);
    }

    #[test]
    fn test_publishing_without_stream_consumer() {
        let (publisher, api) = channel();
        let rx = api.take_stream().unwrap();
        drop(rx);

        // Must not block or panic.
        publisher.publish(analysis(0));
        assert_eq!(api.latest().unwrap().frame_number, 0);
    }

    #[test]
    fn test_readers_on_other_threads() {
        let (publisher, api) = channel();
        publisher.publish(analysis(7));

        let api2 = api.clone();
        let handle = std::thread::spawn(move || api2.latest().unwrap().frame_number);
        assert_eq!(handle.join().unwrap(), 7);
    }
}
