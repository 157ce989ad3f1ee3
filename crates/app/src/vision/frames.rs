//! Latest annotated-frame snapshot shared between the file session and its
//! stream consumers.

use std::sync::{Mutex, PoisonError};

use ml_core::Detection;
use video_ingest::Frame;

/// One frame paired with the detections computed for it.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    pub session_id: u64,
    pub frame_number: u64,
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

/// Detections of the latest snapshot without the pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSnapshot {
    pub session_id: u64,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub detections: Vec<Detection>,
}

/// Single-slot store; every read returns an owned copy.
#[derive(Debug, Default)]
pub struct FrameStore {
    latest: Mutex<Option<FrameSnapshot>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a complete frame/detections pair.
    pub fn write(
        &self,
        session_id: u64,
        frame_number: u64,
        frame: Frame,
        detections: Vec<Detection>,
    ) {
        *self.lock() = Some(FrameSnapshot {
            session_id,
            frame_number,
            frame,
            detections,
        });
    }

    /// Publish a frame ahead of inference with no detections attached.
    pub fn publish_frame(&self, session_id: u64, frame_number: u64, frame: Frame) {
        self.write(session_id, frame_number, frame, Vec::new());
    }

    /// Attach detections to the frame they were computed for. Returns `false`
    /// when the store has moved on to another frame or session.
    pub fn attach_detections(
        &self,
        session_id: u64,
        frame_number: u64,
        detections: Vec<Detection>,
    ) -> bool {
        let mut latest = self.lock();
        match latest.as_mut() {
            Some(snapshot)
                if snapshot.session_id == session_id && snapshot.frame_number == frame_number =>
            {
                snapshot.detections = detections;
                true
            }
            _ => false,
        }
    }

    pub fn read(&self) -> Option<FrameSnapshot> {
        self.lock().clone()
    }

    pub fn read_detections(&self) -> Option<DetectionSnapshot> {
        self.lock().as_ref().map(|snapshot| DetectionSnapshot {
            session_id: snapshot.session_id,
            frame_number: snapshot.frame_number,
            timestamp_ms: snapshot.frame.timestamp_ms,
            detections: snapshot.detections.clone(),
        })
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<FrameSnapshot>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
