//! Actix Web server exposing the control, streaming, upload and result endpoints.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! processing loops stay free from runtime concerns. Blocking engine calls
//! (session start/stop, camera open, predictions, file lookups) go through
//! `web::block`.

use std::{net::SocketAddr, sync::Arc};

use actix_files::NamedFile;
use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, ResponseError,
    dev::Server,
    http::header::{self, ContentDisposition, DispositionParam, DispositionType},
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::vision::{
    config::StreamSettings,
    data::{
        DetectionsResponse, HealthResponse, StatusResponse, VideoProcessingRequest, summarize,
    },
    detection::DetectionAdapter,
    error::SessionError,
    predict::{UploadOutcome, handle_upload},
    results::ResultsDir,
    session::SessionManager,
    stream::{MULTIPART_BOUNDARY, event_stream, spawn_camera_feed},
    telemetry::{prometheus_handle, spawn_thread},
};

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) image_detector: DetectionAdapter,
    pub(crate) results: ResultsDir,
    pub(crate) stream: StreamSettings,
}

#[derive(Default)]
/// Handle for the server thread.
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, std::thread::JoinHandle::is_finished)
    }
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
}

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_UPLOAD_BYTES))
        .route("/video_feed", web::get().to(video_feed_handler))
        .route("/start_camera", web::post().to(start_camera_handler))
        .route("/stop_camera", web::post().to(stop_camera_handler))
        .route(
            "/start_video_processing",
            web::post().to(start_video_processing_handler),
        )
        .route(
            "/stop_video_processing",
            web::post().to(stop_video_processing_handler),
        )
        .route(
            "/video_processing_stream",
            web::get().to(video_processing_stream_handler),
        )
        .route("/detections", web::get().to(detections_handler))
        .route("/download/{filename}", web::get().to(download_handler))
        .route("/results/{filename}", web::get().to(results_handler))
        .route("/predict", web::post().to(predict_handler))
        .route("/health", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Spawn the server thread and return a handle that can stop it.
pub(crate) fn spawn_api_server(state: ServerState, bind_addr: SocketAddr) -> Result<ApiServer> {
    let state = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();
    let handle = spawn_thread("firewatch-api-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = match bind_server(state, bind_addr) {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server
                }
                Err(err) => {
                    let message = err.to_string();
                    let _ = ready_tx.send(Err(err));
                    return Err(std::io::Error::other(message));
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn API server thread")?;

    ready_rx
        .recv()
        .context("API server thread exited before binding")?
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on http://{bind_addr}");

    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn bind_server(state: web::Data<ServerState>, bind_addr: SocketAddr) -> std::io::Result<Server> {
    Ok(HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(bind_addr)?
        .run())
}

fn with_cors(mut builder: actix_web::HttpResponseBuilder) -> actix_web::HttpResponseBuilder {
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"));
    builder
}

fn blocking_error(err: actix_web::error::BlockingError) -> SessionError {
    SessionError::Internal(err.to_string())
}

/// Live camera feed as `multipart/x-mixed-replace`.
async fn video_feed_handler(state: web::Data<ServerState>) -> HttpResponse {
    let quality = state.stream.jpeg_quality;
    let manager = state.manager.clone();
    let opened = web::block(move || spawn_camera_feed(&manager, quality))
        .await
        .map_err(blocking_error)
        .and_then(|opened| opened);
    let mut rx = match opened {
        Ok(rx) => rx,
        Err(err) => return err.error_response(),
    };
    let stream = stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    with_cors(HttpResponse::Ok())
        .append_header(("Cache-Control", "no-cache"))
        .append_header((
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={MULTIPART_BOUNDARY}"),
        ))
        .streaming(stream)
}

async fn start_camera_handler(state: web::Data<ServerState>) -> HttpResponse {
    state.manager.start_camera();
    HttpResponse::Ok().json(StatusResponse::new("camera started"))
}

async fn stop_camera_handler(state: web::Data<ServerState>) -> HttpResponse {
    state.manager.stop_camera();
    HttpResponse::Ok().json(StatusResponse::new("camera stopped"))
}

async fn start_video_processing_handler(
    state: web::Data<ServerState>,
    request: web::Json<VideoProcessingRequest>,
) -> Result<HttpResponse, SessionError> {
    let video_path = request.into_inner().video_path;
    if video_path.trim().is_empty() {
        return Err(SessionError::InvalidRequest("video_path is required".into()));
    }
    let manager = state.manager.clone();
    let path = video_path.clone();
    web::block(move || manager.start_file_session(std::path::Path::new(&path)))
        .await
        .map_err(blocking_error)??;
    Ok(HttpResponse::Ok().json(StatusResponse {
        status: "video processing started",
        video_path: Some(video_path),
    }))
}

async fn stop_video_processing_handler(
    state: web::Data<ServerState>,
) -> Result<HttpResponse, SessionError> {
    let manager = state.manager.clone();
    let report = web::block(move || manager.stop_file_session())
        .await
        .map_err(blocking_error)??;
    Ok(HttpResponse::Ok().json(report))
}

/// Annotated frames of the running file session as server-sent events.
async fn video_processing_stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let events = event_stream(
        state.manager.frames().clone(),
        state.manager.labels().clone(),
        state.stream.clone(),
    );

    with_cors(HttpResponse::Ok())
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(events)
}

/// Return the most recent detection snapshot as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.manager.frames().read_detections() {
        Some(snapshot) => {
            let detections = summarize(&snapshot.detections);
            HttpResponse::Ok().json(DetectionsResponse {
                session_id: snapshot.session_id,
                frame_number: snapshot.frame_number,
                timestamp_ms: snapshot.timestamp_ms,
                detections: &detections,
            })
        }
        None => HttpResponse::NoContent().finish(),
    }
}

async fn download_handler(
    req: HttpRequest,
    state: web::Data<ServerState>,
    filename: web::Path<String>,
) -> Result<HttpResponse, SessionError> {
    serve_result(&req, &state.results, filename.into_inner(), DispositionType::Attachment).await
}

async fn results_handler(
    req: HttpRequest,
    state: web::Data<ServerState>,
    filename: web::Path<String>,
) -> Result<HttpResponse, SessionError> {
    serve_result(&req, &state.results, filename.into_inner(), DispositionType::Inline).await
}

/// Stream a file from the results directory with MIME guessing and range support.
async fn serve_result(
    req: &HttpRequest,
    results: &ResultsDir,
    filename: String,
    disposition: DispositionType,
) -> Result<HttpResponse, SessionError> {
    let results = results.clone();
    let name = filename.clone();
    let file = web::block(move || -> Result<NamedFile, SessionError> {
        let path = results.resolve(&name)?;
        Ok(NamedFile::open(path)?)
    })
    .await
    .map_err(blocking_error)??;

    Ok(file
        .set_content_disposition(ContentDisposition {
            disposition,
            parameters: vec![DispositionParam::Filename(filename)],
        })
        .into_response(req))
}

/// Raw-body upload: `POST /predict?filename=<name>`.
async fn predict_handler(
    state: web::Data<ServerState>,
    query: web::Query<UploadQuery>,
    body: Bytes,
) -> Result<HttpResponse, SessionError> {
    let filename = query.into_inner().filename;
    let state = state.into_inner();
    let outcome = web::block(move || {
        handle_upload(
            &filename,
            &body,
            &state.image_detector,
            state.manager.labels(),
            &state.results,
        )
    })
    .await
    .map_err(blocking_error)??;

    Ok(match outcome {
        UploadOutcome::Video(upload) => HttpResponse::Ok().json(upload),
        UploadOutcome::Image(prediction) => HttpResponse::Ok().json(prediction),
    })
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        file_session: state.manager.active_session(),
        camera_active: state.manager.camera_active(),
        alarm_active: state.manager.alarms().is_active(),
    })
}

async fn metrics_handler() -> HttpResponse {
    match prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
