//! Frame sources and sinks for the firewatch processing engine.
//!
//! - `types`: `Frame`, stream properties and the source/sink/backend traits.
//! - `ffmpeg`: default backend driving `ffmpeg`/`ffprobe` subprocesses.
//! - `camera`: device index helpers and the optional OpenCV backend.
//! - `synthetic`: generated frames behind `stub://` URIs.

mod camera;
mod ffmpeg;
mod synthetic;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvBackend;
pub use camera::{device_path, parse_device_index};
pub use ffmpeg::{FALLBACK_FPS, FfmpegBackend, FfmpegSource, FfmpegWriter};
pub use synthetic::SyntheticSource;
pub use types::{
    CaptureError, Frame, FrameFormat, MediaBackend, SourceProperties, VideoSink, VideoSource,
};
