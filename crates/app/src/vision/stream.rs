//! Streaming generators: the live camera multipart feed and the server-sent
//! event stream over the file session's frame store.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use actix_web::web::Bytes;
use anyhow::Result;
use async_stream::stream;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};
use video_ingest::VideoSource;

use crate::vision::{
    alarm::AlarmDispatcher,
    annotation::render_jpeg,
    config::StreamSettings,
    data::{FrameEvent, summarize},
    detection::DetectionAdapter,
    error::SessionError,
    frames::{FrameSnapshot, FrameStore},
    hazard::{HazardLabels, HazardTracker},
    session::SessionManager,
    telemetry::spawn_thread,
};

pub(crate) const MULTIPART_BOUNDARY: &str = "frame";
const FEED_BUFFER: usize = 2;

/// Tracks connected stream clients in the `firewatch_stream_clients` gauge.
struct ClientGauge(&'static str);

impl ClientGauge {
    fn new(stream: &'static str) -> Self {
        metrics::gauge!("firewatch_stream_clients", "stream" => stream).increment(1.0);
        Self(stream)
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        metrics::gauge!("firewatch_stream_clients", "stream" => self.0).decrement(1.0);
    }
}

pub(crate) fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}

/// Open the camera and start a feed thread for one client.
///
/// The thread owns its capture handle and hazard windows. It ends when the
/// camera flag is cleared, the client goes away or the camera stops producing
/// frames, and releases the device on the way out.
pub(crate) fn spawn_camera_feed(
    manager: &SessionManager,
    jpeg_quality: u8,
) -> Result<mpsc::Receiver<Bytes>, SessionError> {
    if !manager.camera_active() {
        return Err(SessionError::CameraInactive);
    }
    let source = manager.open_camera()?;
    let (tx, rx) = mpsc::channel(FEED_BUFFER);
    let feed = CameraFeed {
        source,
        tx,
        active: manager.camera_flag(),
        detector: manager.camera_detector().clone(),
        alarms: manager.alarms().clone(),
        tracker: HazardTracker::new(manager.labels().clone()),
        labels: manager.labels().clone(),
        jpeg_quality,
    };
    spawn_thread("camera-feed", move || feed.run())
        .map_err(|err| SessionError::Internal(format!("failed to spawn camera feed: {err}")))?;
    Ok(rx)
}

struct CameraFeed {
    source: Box<dyn VideoSource>,
    tx: mpsc::Sender<Bytes>,
    active: Arc<AtomicBool>,
    detector: DetectionAdapter,
    alarms: Arc<AlarmDispatcher>,
    tracker: HazardTracker,
    labels: HazardLabels,
    jpeg_quality: u8,
}

impl CameraFeed {
    fn run(mut self) {
        let span = info_span!("camera.feed");
        let _enter = span.enter();
        let _client = ClientGauge::new("camera");

        let mut sent = 0u64;
        while self.active.load(Ordering::SeqCst) {
            let frame = match self.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("camera stopped producing frames");
                    break;
                }
                Err(err) => {
                    warn!("camera read failed: {err}");
                    break;
                }
            };
            let output = match self.detector.detect(&frame) {
                Ok(output) => output,
                Err(err) => {
                    warn!("{err}");
                    break;
                }
            };
            self.tracker
                .observe_and_dispatch(&output.detections, &self.alarms);
            metrics::counter!("firewatch_frames_processed_total", "source" => "camera")
                .increment(1);

            let jpeg = match render_jpeg(
                &frame,
                &output.detections,
                &self.labels,
                self.jpeg_quality,
            ) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    warn!("camera frame skipped: {err:#}");
                    continue;
                }
            };
            if self
                .tx
                .blocking_send(Bytes::from(multipart_chunk(&jpeg)))
                .is_err()
            {
                debug!("camera feed client disconnected");
                break;
            }
            sent += 1;
        }

        self.source.close();
        info!("camera feed ended after {sent} frame(s)");
    }
}

/// Per-client event stream over the frame store. Emits the latest annotated
/// frame every `event_interval`, repeating it when the producer is slower.
pub(crate) fn event_stream(
    frames: Arc<FrameStore>,
    labels: HazardLabels,
    settings: StreamSettings,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    stream! {
        let _client = ClientGauge::new("events");
        loop {
            let Some(snapshot) = frames.read() else {
                tokio::time::sleep(settings.empty_retry).await;
                continue;
            };
            let labels = labels.clone();
            let quality = settings.jpeg_quality;
            match tokio::task::spawn_blocking(move || render_event(&snapshot, &labels, quality)).await {
                Ok(Ok(event)) => yield Ok::<Bytes, actix_web::Error>(Bytes::from(event)),
                Ok(Err(err)) => warn!("event frame skipped: {err:#}"),
                Err(err) => warn!("event render task failed: {err}"),
            }
            tokio::time::sleep(settings.event_interval).await;
        }
    }
}

/// `data: {"frame": <base64 jpeg>, "detections": [...], "timestamp": <unix secs>}\n\n`
pub(crate) fn render_event(
    snapshot: &FrameSnapshot,
    labels: &HazardLabels,
    quality: u8,
) -> Result<String> {
    let jpeg = render_jpeg(&snapshot.frame, &snapshot.detections, labels, quality)?;
    let frame = STANDARD.encode(jpeg);
    let detections = summarize(&snapshot.detections);
    let payload = FrameEvent {
        frame: &frame,
        detections: &detections,
        timestamp: Utc::now().timestamp_micros() as f64 / 1e6,
    };
    Ok(format!("data: {}\n\n", serde_json::to_string(&payload)?))
}
