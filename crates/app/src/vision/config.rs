//! Configuration parsing for the firewatch engine.
//!
//! This module owns translation of CLI arguments into a `ServiceConfig` struct
//! which the session manager, stream generators and server use without
//! re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use video_ingest::parse_device_index;

use crate::vision::hazard::HazardLabels;

#[derive(Clone, Debug)]
/// Canonical configuration shared by every component of the service.
pub struct ServiceConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Directory receiving uploads and annotated artifacts.
    pub results_dir: PathBuf,
    /// Detector model and class mapping.
    pub detector: DetectorSettings,
    /// Live camera feed settings.
    pub camera: CameraSettings,
    /// File processing session settings.
    pub session: SessionSettings,
    /// Confidence threshold for still image predictions.
    pub image_confidence: f32,
    /// Class labels matched as fire and smoke.
    pub hazards: HazardLabels,
    /// Alarm sound configuration.
    pub alarm: AlarmSettings,
    /// Annotated stream output settings.
    pub stream: StreamSettings,
    /// Emit verbose logging (per-frame detections).
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// TorchScript model path.
    pub model_path: PathBuf,
    /// Class names indexed by model class id.
    pub class_names: Vec<String>,
    /// Model input size as (width, height).
    pub input_size: (i64, i64),
    /// Force CPU inference.
    pub use_cpu: bool,
}

#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub device_index: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub confidence: f32,
    /// Write annotated output video for file sessions.
    pub persist_output: bool,
    pub results_dir: PathBuf,
    /// Upper bound on waiting for a previous session to reach idle.
    pub stop_timeout: Duration,
    /// Pacing rate used when the source does not report its frame rate.
    pub fallback_fps: f64,
}

#[derive(Clone, Debug)]
pub struct AlarmSettings {
    /// Disable audio; alarms are logged only.
    pub muted: bool,
    pub fire_sound: PathBuf,
    pub smoke_sound: PathBuf,
    /// External player program invoked with the sound file path.
    pub player: String,
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// JPEG quality used by both streaming generators (1-100).
    pub jpeg_quality: u8,
    /// Fixed period between server-sent events.
    pub event_interval: Duration,
    /// Wait before retrying an empty frame store.
    pub empty_retry: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            event_interval: Duration::from_millis(33),
            empty_retry: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing engine spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Engine flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct EngineArgs {
    /// TorchScript detector model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Comma separated class names in model class-id order.
    #[arg(long = "classes", value_name = "NAMES", value_delimiter = ',', default_value = "fire,smoke")]
    pub classes: Vec<String>,
    /// Detector input width in pixels.
    #[arg(long = "detector-width", value_name = "PX", default_value_t = 640)]
    pub detector_width: i64,
    /// Detector input height in pixels.
    #[arg(long = "detector-height", value_name = "PX", default_value_t = 640)]
    pub detector_height: i64,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,

    /// Address for the HTTP server.
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0:8000")]
    pub bind: String,
    /// Directory for uploads and annotated results.
    #[arg(long = "results-dir", value_name = "DIR", default_value = "results")]
    pub results_dir: PathBuf,

    /// Camera device index or `/dev/videoN` path.
    #[arg(long = "camera", value_name = "DEVICE", default_value = "0")]
    pub camera: String,
    /// Camera capture width in pixels.
    #[arg(long = "camera-width", value_name = "PX", default_value_t = 640)]
    pub camera_width: i32,
    /// Camera capture height in pixels.
    #[arg(long = "camera-height", value_name = "PX", default_value_t = 480)]
    pub camera_height: i32,

    /// Confidence threshold for file processing sessions.
    #[arg(long = "video-confidence", value_name = "SCORE", default_value_t = 0.3)]
    pub video_confidence: f32,
    /// Confidence threshold for the live camera feed.
    #[arg(long = "camera-confidence", value_name = "SCORE", default_value_t = 0.4)]
    pub camera_confidence: f32,
    /// Confidence threshold for still image predictions.
    #[arg(long = "image-confidence", value_name = "SCORE", default_value_t = 0.4)]
    pub image_confidence: f32,

    /// Class keyword treated as fire.
    #[arg(long = "fire-label", value_name = "LABEL", default_value = "fire")]
    pub fire_label: String,
    /// Class keyword treated as smoke.
    #[arg(long = "smoke-label", value_name = "LABEL", default_value = "smoke")]
    pub smoke_label: String,

    /// Sound played when fire is confirmed.
    #[arg(long = "fire-sound", value_name = "PATH", default_value = "sounds/fire_alert_sound.mp3")]
    pub fire_sound: PathBuf,
    /// Sound played when smoke is confirmed.
    #[arg(long = "smoke-sound", value_name = "PATH", default_value = "sounds/smoke_alert_sound.mp3")]
    pub smoke_sound: PathBuf,
    /// External audio player program.
    #[arg(long = "alert-player", value_name = "PROGRAM", default_value = "ffplay")]
    pub alert_player: String,
    /// Log alarms without playing audio.
    #[arg(long = "no-audio", action = clap::ArgAction::SetTrue)]
    pub no_audio: bool,

    /// JPEG quality used by the stream encoders (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: i32,
    /// Server-sent event rate in events per second.
    #[arg(long = "event-fps", value_name = "FPS", default_value_t = 30.0)]
    pub event_fps: f64,
    /// Milliseconds to wait for a running session to stop.
    #[arg(long = "stop-timeout-ms", value_name = "MS", default_value_t = 5000)]
    pub stop_timeout_ms: u64,
    /// Do not write annotated output videos.
    #[arg(long = "no-persist-output", action = clap::ArgAction::SetTrue)]
    pub no_persist_output: bool,

    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<EngineArgs> for ServiceConfig {
    type Error = anyhow::Error;

    fn try_from(args: EngineArgs) -> Result<Self> {
        let model_path = args
            .model_path
            .ok_or_else(|| anyhow!("Missing model path. Provide --model <path>."))?;

        let bind_addr: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("--bind must be a socket address, got {}", args.bind))?;

        let class_names: Vec<String> = args
            .classes
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if class_names.is_empty() {
            bail!("--classes must name at least one class");
        }
        if args.detector_width <= 0 || args.detector_height <= 0 {
            bail!("Detector dimensions must be positive integers");
        }

        let device_index = parse_device_index(&args.camera)
            .ok_or_else(|| anyhow!("--camera must be a device index or /dev/videoN path"))?;
        if args.camera_width <= 0 || args.camera_height <= 0 {
            bail!("Camera width and height must be positive integers");
        }

        for (flag, value) in [
            ("--video-confidence", args.video_confidence),
            ("--camera-confidence", args.camera_confidence),
            ("--image-confidence", args.image_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{flag} must be between 0 and 1");
            }
        }

        let fire_label = args.fire_label.trim().to_string();
        let smoke_label = args.smoke_label.trim().to_string();
        if fire_label.is_empty() || smoke_label.is_empty() {
            bail!("Hazard labels must not be empty");
        }

        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if !(args.event_fps.is_finite() && args.event_fps > 0.0) {
            bail!("--event-fps must be a positive number");
        }
        if args.stop_timeout_ms == 0 {
            bail!("--stop-timeout-ms must be at least 1");
        }

        Ok(Self {
            bind_addr,
            results_dir: args.results_dir.clone(),
            detector: DetectorSettings {
                model_path,
                class_names,
                input_size: (args.detector_width, args.detector_height),
                use_cpu: args.use_cpu,
            },
            camera: CameraSettings {
                device_index,
                width: args.camera_width,
                height: args.camera_height,
                confidence: args.camera_confidence,
            },
            session: SessionSettings {
                confidence: args.video_confidence,
                persist_output: !args.no_persist_output,
                results_dir: args.results_dir,
                stop_timeout: Duration::from_millis(args.stop_timeout_ms),
                fallback_fps: video_ingest::FALLBACK_FPS,
            },
            image_confidence: args.image_confidence,
            hazards: HazardLabels::new(fire_label, smoke_label),
            alarm: AlarmSettings {
                muted: args.no_audio,
                fire_sound: args.fire_sound,
                smoke_sound: args.smoke_sound,
                player: args.alert_player,
            },
            stream: StreamSettings {
                jpeg_quality: args.jpeg_quality as u8,
                event_interval: Duration::from_secs_f64(1.0 / args.event_fps),
                ..StreamSettings::default()
            },
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
