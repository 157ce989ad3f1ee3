use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a packed BGR8 buffer, stamping it with the current wall clock.
    pub fn bgr(data: Vec<u8>, width: i32, height: i32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Number of bytes a packed frame of this size occupies.
    pub fn expected_len(&self) -> usize {
        frame_len(self.width, self.height, self.format)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

pub(crate) fn frame_len(width: i32, height: i32, format: FrameFormat) -> usize {
    (width.max(0) as usize) * (height.max(0) as usize) * format.channels()
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to probe {uri:?}: {reason}")]
    Probe { uri: String, reason: String },
    #[error("frame buffer has {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stream properties reported by a source once it is open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceProperties {
    /// Native frame rate; `0.0` when the container does not report one.
    pub fps: f64,
    pub width: i32,
    pub height: i32,
}

/// A readable stream of frames: a video file or a live device.
pub trait VideoSource: Send {
    /// Next frame, or `None` once the stream is exhausted.
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn properties(&self) -> SourceProperties;

    /// Release the underlying handle. Safe to call more than once.
    fn close(&mut self);
}

/// Destination for annotated frames, finalised into a playable file.
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), CaptureError>;

    fn frames_written(&self) -> u64;

    /// Flush and close the container, returning the final path.
    fn finish(self: Box<Self>) -> Result<PathBuf, CaptureError>;
}

/// Factory for sources and sinks so the processing engine stays backend agnostic.
pub trait MediaBackend: Send + Sync {
    fn open_file(&self, path: &Path) -> Result<Box<dyn VideoSource>, CaptureError>;

    /// Open a capture device by index, scaled to `target_size` (width, height).
    fn open_device(
        &self,
        index: i32,
        target_size: (i32, i32),
    ) -> Result<Box<dyn VideoSource>, CaptureError>;

    fn create_writer(
        &self,
        path: &Path,
        fps: f64,
        size: (i32, i32),
    ) -> Result<Box<dyn VideoSink>, CaptureError>;
}
