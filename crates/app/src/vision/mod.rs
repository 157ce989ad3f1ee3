//! Fire and smoke detection engine: file processing sessions, a live camera
//! feed, hazard confirmation with audible alarms, and an HTTP API on top.
//!
//! The module is split into focused submodules:
//! - `config`: CLI flags and the validated service configuration.
//! - `detection`: Shared detector handle with per-caller confidence.
//! - `hazard`: Sliding windows that confirm fire and smoke.
//! - `alarm`: Single-flight alert playback.
//! - `frames`: Latest frame and detection snapshot of the file session.
//! - `session`: File session lifecycle and camera control.
//! - `annotation`: Box and label drawing plus JPEG encoding.
//! - `stream`: Multipart camera feed and server-sent event generators.
//! - `predict`: Single image prediction and upload intake.
//! - `results`: Artifact naming and lookups in the results directory.
//! - `server`: Actix Web endpoints.
//! - `pipeline`: Command entry points.
//! - `telemetry`: Tracing subscriber, Prometheus recorder, named threads.
//! - `data`: Response payloads.
//! - `error`: Engine error type and its HTTP mapping.

/// Re-export configuration so the CLI can build runs without reaching into submodules.
pub use config::{EngineArgs, ServiceConfig};
/// Command entry points.
pub use pipeline::{run_predict, run_process, run_server};

mod alarm;
mod annotation;
mod config;
mod data;
mod detection;
mod error;
mod frames;
mod hazard;
mod pipeline;
mod predict;
mod results;
mod server;
mod session;
mod stream;
pub(crate) mod telemetry;
