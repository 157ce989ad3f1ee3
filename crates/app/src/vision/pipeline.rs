//! Entry points wiring the engine together for the `serve`, `process` and
//! `predict` commands.
//!
//! Everything long-lived (detector, alarm dispatcher, media backend, session
//! manager) is built once here and handed to the server or driven directly.

use std::{
    path::Path,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{info, info_span, warn};
use video_ingest::MediaBackend;

use crate::vision::{
    ServiceConfig,
    alarm::AlarmDispatcher,
    detection::{DetectionAdapter, load_model},
    predict::predict_file,
    results::ResultsDir,
    server::{ServerState, spawn_api_server},
    session::{SessionManager, SessionWait},
    telemetry,
};

const SUPERVISOR_TICK: Duration = Duration::from_millis(200);

/// Run the HTTP service until Ctrl+C or the server thread exits.
pub fn run_server(config: ServiceConfig) -> Result<()> {
    let shutdown = install_shutdown_flag();
    let _ = telemetry::init_metrics_recorder();
    let span = info_span!(
        "firewatch.serve",
        bind = %config.bind_addr,
        model = %config.detector.model_path.display(),
        camera = config.camera.device_index,
    );
    let _enter = span.enter();

    let (manager, image_detector) = build_engine(&config)?;
    let manager = Arc::new(manager);
    let state = ServerState {
        manager: manager.clone(),
        image_detector,
        results: ResultsDir::new(&config.results_dir),
        stream: config.stream.clone(),
    };
    state
        .results
        .ensure()
        .with_context(|| format!("failed to create {}", config.results_dir.display()))?;

    let server = spawn_api_server(state, config.bind_addr)?;
    while !shutdown.load(Ordering::SeqCst) && !server.is_finished() {
        thread::sleep(SUPERVISOR_TICK);
    }

    info!("shutting down");
    manager.shutdown();
    server.stop();
    Ok(())
}

/// Process one video file to completion without the HTTP layer and print the
/// session summary as JSON.
pub fn run_process(config: ServiceConfig, video: &Path) -> Result<()> {
    let shutdown = install_shutdown_flag();
    let (manager, _) = build_engine(&config)?;
    let session_id = manager.start_file_session(video)?;
    info!("processing {} as session {session_id}", video.display());

    let summary = loop {
        if shutdown.load(Ordering::SeqCst) {
            match manager.cancel_file_session()? {
                Some(summary) => break summary,
                None => return Ok(()),
            }
        }
        match manager.wait_file_session(SUPERVISOR_TICK) {
            SessionWait::Finished(summary) => break summary,
            SessionWait::Running => {}
            SessionWait::Idle => return Ok(()),
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Predict a single image and print the response as JSON.
pub fn run_predict(config: ServiceConfig, image: &Path) -> Result<()> {
    let model = load_model(&config.detector)?;
    let detector = DetectionAdapter::new(model, config.image_confidence);
    let results = ResultsDir::new(&config.results_dir);
    let prediction = predict_file(image, &detector, &config.hazards, &results)
        .with_context(|| format!("prediction failed for {}", image.display()))?;
    println!("{}", serde_json::to_string_pretty(&prediction)?);
    Ok(())
}

fn build_engine(config: &ServiceConfig) -> Result<(SessionManager, DetectionAdapter)> {
    let model = load_model(&config.detector)?;
    let image_detector = DetectionAdapter::new(model.clone(), config.image_confidence);
    let alarms = Arc::new(AlarmDispatcher::from_settings(&config.alarm));
    let manager = SessionManager::new(
        media_backend(),
        model,
        alarms,
        config.hazards.clone(),
        config.session.clone(),
        config.camera.clone(),
    );
    Ok((manager, image_detector))
}

#[cfg(feature = "with-opencv")]
fn media_backend() -> Arc<dyn MediaBackend> {
    Arc::new(video_ingest::OpenCvBackend)
}

#[cfg(not(feature = "with-opencv"))]
fn media_backend() -> Arc<dyn MediaBackend> {
    Arc::new(video_ingest::FfmpegBackend::default())
}

fn install_shutdown_flag() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();
    static SHUTDOWN: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

    let shutdown = SHUTDOWN
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();
    CTRL_HANDLER.call_once(|| {
        let handler_shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}
