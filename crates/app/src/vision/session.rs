//! File processing sessions and camera control.
//!
//! [`SessionManager`] owns everything the background loops share: the frame
//! store, the alarm dispatcher, the detector handle and the media backend. At
//! most one file session runs at a time; starting a new one first stops the
//! previous loop and waits for it to release its resources, so two loops never
//! write the frame store concurrently.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, Frame, MediaBackend, SourceProperties, VideoSink, VideoSource};

use crate::vision::{
    alarm::AlarmDispatcher,
    annotation::annotate_frame,
    config::{CameraSettings, SessionSettings},
    data::StopReport,
    detection::{DetectionAdapter, SharedModel},
    error::SessionError,
    frames::FrameStore,
    hazard::{HazardLabels, HazardTracker},
    results::{ResultsDir, artifact_timestamp, output_extension, result_url},
    telemetry::spawn_thread,
};

/// Loop side of a cancellation pair. Cancellation is signalled by dropping the
/// sender, so every waiter observes a disconnect.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`, returning `true` as soon as cancellation is requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded(0);
    (CancelHandle { tx: Some(tx) }, CancelToken { rx })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Stopped on request.
    Cancelled,
    /// The source reached end of stream.
    Exhausted,
    /// The source failed mid-stream.
    SourceError,
    /// The detector failed on a frame.
    InferenceFailure,
    /// The loop thread ended without reporting (panic).
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: u64,
    pub frames_processed: u64,
    pub frames_written: u64,
    pub exit: ExitReason,
    pub output_path: Option<PathBuf>,
}

impl SessionSummary {
    fn aborted(session_id: u64) -> Self {
        Self {
            session_id,
            frames_processed: 0,
            frames_written: 0,
            exit: ExitReason::Aborted,
            output_path: None,
        }
    }
}

/// Outcome of [`SessionManager::wait_file_session`].
#[derive(Debug)]
pub enum SessionWait {
    Idle,
    Running,
    Finished(SessionSummary),
}

struct SessionTask {
    id: u64,
    cancel: CancelHandle,
    done: Receiver<SessionSummary>,
    handle: Option<JoinHandle<()>>,
}

impl SessionTask {
    /// Wait for the loop to report, then join it. `None` when `timeout` elapses first.
    fn wait(&mut self, timeout: Option<Duration>) -> Option<SessionSummary> {
        let received = match timeout {
            Some(timeout) => match self.done.recv_timeout(timeout) {
                Ok(summary) => Some(summary),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.done.recv().ok(),
        };
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("file session {} loop panicked", self.id);
            }
        }
        Some(received.unwrap_or_else(|| SessionSummary::aborted(self.id)))
    }
}

pub struct SessionManager {
    media: Arc<dyn MediaBackend>,
    frames: Arc<FrameStore>,
    alarms: Arc<AlarmDispatcher>,
    file_detector: DetectionAdapter,
    camera_detector: DetectionAdapter,
    labels: HazardLabels,
    settings: SessionSettings,
    camera: CameraSettings,
    active: Mutex<Option<SessionTask>>,
    last_output: Arc<Mutex<Option<PathBuf>>>,
    next_id: AtomicU64,
    /// Id of the loop still running, 0 when none. Never guarded by `active`.
    running: Arc<AtomicU64>,
    camera_active: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        media: Arc<dyn MediaBackend>,
        model: SharedModel,
        alarms: Arc<AlarmDispatcher>,
        labels: HazardLabels,
        settings: SessionSettings,
        camera: CameraSettings,
    ) -> Self {
        let file_detector = DetectionAdapter::new(model, settings.confidence);
        let camera_detector = file_detector.with_confidence(camera.confidence);
        Self {
            media,
            frames: Arc::new(FrameStore::new()),
            alarms,
            file_detector,
            camera_detector,
            labels,
            settings,
            camera,
            active: Mutex::new(None),
            last_output: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            running: Arc::new(AtomicU64::new(0)),
            camera_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop any running session, then start processing `path` in the background.
    pub fn start_file_session(&self, path: &Path) -> Result<u64, SessionError> {
        let mut slot = self.lock_active();
        if let Some(summary) = self.stop_task(&mut slot)? {
            debug!(
                "session {} replaced after {} frame(s)",
                summary.session_id, summary.frames_processed
            );
        }

        self.frames.reset();
        let source = self
            .media
            .open_file(path)
            .map_err(SessionError::SourceUnavailable)?;
        let properties = source.properties();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        *lock(&self.last_output) = None;
        let writer = if self.settings.persist_output {
            self.open_writer(path, properties)
        } else {
            None
        };

        let fps = if properties.fps > 0.0 {
            properties.fps
        } else {
            self.settings.fallback_fps
        };
        let (cancel, token) = cancel_pair();
        let (done_tx, done_rx) = bounded(1);
        let session = SessionLoop {
            id,
            source_path: path.to_path_buf(),
            frames: self.frames.clone(),
            alarms: self.alarms.clone(),
            detector: self.file_detector.clone(),
            labels: self.labels.clone(),
            tracker: HazardTracker::new(self.labels.clone()),
            token,
            frame_interval: Duration::from_secs_f64(1.0 / fps),
        };
        let resources = SessionResources {
            source: Some(source),
            writer,
            frames_written: 0,
            output_slot: self.last_output.clone(),
        };

        self.running.store(id, Ordering::SeqCst);
        let running = RunningMarker {
            slot: self.running.clone(),
            id,
        };
        let handle = spawn_thread(format!("file-session-{id}"), move || {
            let summary = {
                let _running = running;
                session.run(resources)
            };
            let _ = done_tx.send(summary);
        })
        .map_err(|err| SessionError::Internal(format!("failed to spawn session thread: {err}")))?;

        info!(
            "file session {id} started for {} ({}x{} @ {fps:.2} fps)",
            path.display(),
            properties.width,
            properties.height
        );
        *slot = Some(SessionTask {
            id,
            cancel,
            done: done_rx,
            handle: Some(handle),
        });
        Ok(id)
    }

    /// Stop the running session (if any) and report the last annotated output.
    pub fn stop_file_session(&self) -> Result<StopReport, SessionError> {
        self.cancel_file_session()?;
        let output = lock(&self.last_output)
            .clone()
            .filter(|path| path.is_file());
        Ok(StopReport {
            status: "video processing stopped",
            annotated_video_url: output.as_deref().and_then(result_url),
            annotated_video_path: output.map(|path| path.display().to_string()),
        })
    }

    /// Stop the running session and return its summary.
    pub fn cancel_file_session(&self) -> Result<Option<SessionSummary>, SessionError> {
        let mut slot = self.lock_active();
        self.stop_task(&mut slot)
    }

    /// Wait up to `timeout` for the running session to finish on its own.
    pub fn wait_file_session(&self, timeout: Duration) -> SessionWait {
        let mut slot = self.lock_active();
        let Some(task) = slot.as_mut() else {
            return SessionWait::Idle;
        };
        match task.wait(Some(timeout)) {
            Some(summary) => {
                *slot = None;
                SessionWait::Finished(summary)
            }
            None => SessionWait::Running,
        }
    }

    /// Id of the session whose loop is still running. Does not wait on a
    /// concurrent stop or restart.
    pub fn active_session(&self) -> Option<u64> {
        match self.running.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn start_camera(&self) {
        self.camera_active.store(true, Ordering::SeqCst);
        info!("camera started");
    }

    pub fn stop_camera(&self) {
        self.camera_active.store(false, Ordering::SeqCst);
        info!("camera stopped");
    }

    pub fn camera_active(&self) -> bool {
        self.camera_active.load(Ordering::SeqCst)
    }

    pub(crate) fn camera_flag(&self) -> Arc<AtomicBool> {
        self.camera_active.clone()
    }

    pub(crate) fn open_camera(&self) -> Result<Box<dyn VideoSource>, SessionError> {
        self.media
            .open_device(self.camera.device_index, (self.camera.width, self.camera.height))
            .map_err(SessionError::SourceUnavailable)
    }

    pub(crate) fn camera_detector(&self) -> &DetectionAdapter {
        &self.camera_detector
    }

    pub(crate) fn frames(&self) -> &Arc<FrameStore> {
        &self.frames
    }

    pub(crate) fn alarms(&self) -> &Arc<AlarmDispatcher> {
        &self.alarms
    }

    pub(crate) fn labels(&self) -> &HazardLabels {
        &self.labels
    }

    /// Stop the camera feed and any running session.
    pub fn shutdown(&self) {
        self.stop_camera();
        match self.cancel_file_session() {
            Ok(Some(summary)) => info!(
                "file session {} stopped at shutdown after {} frame(s)",
                summary.session_id, summary.frames_processed
            ),
            Ok(None) => {}
            Err(err) => warn!("shutdown: {err}"),
        }
    }

    /// Cancel the task in `slot` and wait for it within the stop timeout. On
    /// timeout the task stays in place and nothing else is touched.
    fn stop_task(
        &self,
        slot: &mut Option<SessionTask>,
    ) -> Result<Option<SessionSummary>, SessionError> {
        let Some(task) = slot.as_mut() else {
            return Ok(None);
        };
        task.cancel.cancel();
        match task.wait(Some(self.settings.stop_timeout)) {
            Some(summary) => {
                *slot = None;
                Ok(Some(summary))
            }
            None => {
                warn!(
                    "file session {} did not stop within {:?}",
                    task.id, self.settings.stop_timeout
                );
                Err(SessionError::StopTimeout(self.settings.stop_timeout))
            }
        }
    }

    fn open_writer(&self, input: &Path, properties: SourceProperties) -> Option<Box<dyn VideoSink>> {
        let results = ResultsDir::new(&self.settings.results_dir);
        if let Err(err) = results.ensure() {
            warn!("{}", SessionError::Writer(CaptureError::Io(err)));
            return None;
        }
        let output = results.artifact_path("annotated", &artifact_timestamp(), &output_extension(input));
        match self.media.create_writer(
            &output,
            properties.fps,
            (properties.width, properties.height),
        ) {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!("{}; continuing without saved output", SessionError::Writer(err));
                None
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<SessionTask>> {
        lock(&self.active)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the running id when the loop thread exits, including by panic.
struct RunningMarker {
    slot: Arc<AtomicU64>,
    id: u64,
}

impl Drop for RunningMarker {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.id, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Source and writer owned by one loop. Released explicitly at the end of the
/// loop and again by `Drop` if the thread unwinds.
struct SessionResources {
    source: Option<Box<dyn VideoSource>>,
    writer: Option<Box<dyn VideoSink>>,
    frames_written: u64,
    output_slot: Arc<Mutex<Option<PathBuf>>>,
}

impl SessionResources {
    fn write_annotated(&mut self, frame: &Frame, detections: &[ml_core::Detection], labels: &HazardLabels) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let written = annotate_frame(frame, detections, labels)
            .map_err(CaptureError::Other)
            .and_then(|annotated| writer.write(&annotated));
        match written {
            Ok(()) => self.frames_written += 1,
            Err(err) => {
                warn!("{}; continuing without saved output", SessionError::Writer(err));
                if let Some(writer) = self.writer.take() {
                    let _ = writer.finish();
                }
            }
        }
    }

    fn release(&mut self) -> Option<PathBuf> {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        let writer = self.writer.take()?;
        match writer.finish() {
            Ok(path) => {
                info!("annotated output saved to {}", path.display());
                *lock(&self.output_slot) = Some(path.clone());
                Some(path)
            }
            Err(err) => {
                warn!("failed to finalise annotated output: {err}");
                None
            }
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.release();
    }
}

struct SessionLoop {
    id: u64,
    source_path: PathBuf,
    frames: Arc<FrameStore>,
    alarms: Arc<AlarmDispatcher>,
    detector: DetectionAdapter,
    labels: HazardLabels,
    tracker: HazardTracker,
    token: CancelToken,
    frame_interval: Duration,
}

impl SessionLoop {
    fn run(mut self, mut resources: SessionResources) -> SessionSummary {
        let span = info_span!("session", id = self.id, source = %self.source_path.display());
        let _enter = span.enter();

        let mut frames_processed = 0;
        let exit = self.drive(&mut resources, &mut frames_processed);
        let output_path = resources.release();
        info!("file session ended ({exit:?}) after {frames_processed} frame(s)");

        SessionSummary {
            session_id: self.id,
            frames_processed,
            frames_written: resources.frames_written,
            exit,
            output_path,
        }
    }

    fn drive(&mut self, resources: &mut SessionResources, processed: &mut u64) -> ExitReason {
        let mut frame_number = 0u64;
        loop {
            if self.token.is_cancelled() {
                return ExitReason::Cancelled;
            }
            let started = Instant::now();

            let Some(source) = resources.source.as_mut() else {
                return ExitReason::SourceError;
            };
            let frame = match source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => return ExitReason::Exhausted,
                Err(err) => {
                    warn!("video source failed: {err}");
                    return ExitReason::SourceError;
                }
            };
            frame_number += 1;
            self.frames.publish_frame(self.id, frame_number, frame.clone());

            let output = match self.detector.detect(&frame) {
                Ok(output) => output,
                Err(err) => {
                    error!("frame {frame_number}: {err}");
                    return ExitReason::InferenceFailure;
                }
            };
            if !output.detections.is_empty() {
                debug!(
                    "frame {frame_number}: {} detection(s) in {:.1} ms",
                    output.detections.len(),
                    output.timing.total_ms()
                );
            }
            self.frames
                .attach_detections(self.id, frame_number, output.detections.clone());
            self.tracker
                .observe_and_dispatch(&output.detections, &self.alarms);
            resources.write_annotated(&frame, &output.detections, &self.labels);

            *processed += 1;
            metrics::counter!("firewatch_frames_processed_total", "source" => "file").increment(1);

            let remaining = self.frame_interval.saturating_sub(started.elapsed());
            if self.token.wait(remaining) {
                return ExitReason::Cancelled;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use anyhow::Result;
    use ml_core::{DetectionOutput, ObjectDetector};

    use super::{testing::*, *};
    use crate::vision::{
        detection::{share, testing::ScriptedDetector},
        hazard::Hazard,
    };

    fn settings(results_dir: &Path, stop_timeout: Duration) -> SessionSettings {
        SessionSettings {
            confidence: 0.3,
            persist_output: true,
            results_dir: results_dir.to_path_buf(),
            stop_timeout,
            fallback_fps: 30.0,
        }
    }

    fn camera() -> CameraSettings {
        CameraSettings {
            device_index: 0,
            width: 16,
            height: 12,
            confidence: 0.4,
        }
    }

    fn manager_with(
        media: TestMedia,
        detector: impl ObjectDetector + 'static,
        player: Arc<CountingPlayer>,
        settings: SessionSettings,
    ) -> SessionManager {
        SessionManager::new(
            Arc::new(media),
            share(detector),
            Arc::new(AlarmDispatcher::new(player)),
            HazardLabels::default(),
            settings,
            camera(),
        )
    }

    fn wait_finished(manager: &SessionManager) -> SessionSummary {
        match manager.wait_file_session(Duration::from_secs(10)) {
            SessionWait::Finished(summary) => summary,
            other => panic!("session did not finish: {other:?}"),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Sleeps inside every detection call.
    struct SlowDetector(Duration);

    impl ObjectDetector for SlowDetector {
        fn detect(&mut self, _: &[u8], _: i32, _: i32, _: f32) -> Result<DetectionOutput> {
            thread::sleep(self.0);
            Ok(DetectionOutput::default())
        }
    }

    #[test]
    fn exhausted_source_processes_every_frame_and_saves_output() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(Some(5), 1000.0),
            ScriptedDetector::always(&["smoke"]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );

        let id = manager.start_file_session(Path::new("clip.avi")).unwrap();
        let summary = wait_finished(&manager);
        assert_eq!(summary.session_id, id);
        assert_eq!(summary.exit, ExitReason::Exhausted);
        assert_eq!(summary.frames_processed, 5);
        assert_eq!(summary.frames_written, 5);

        let output = summary.output_path.unwrap();
        assert!(output.starts_with(dir.path()));
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("annotated_") && name.ends_with(".avi"));

        let snapshot = manager.frames().read().unwrap();
        assert_eq!((snapshot.session_id, snapshot.frame_number), (id, 5));
        assert_eq!(snapshot.detections[0].class_label, "smoke");

        let report = manager.stop_file_session().unwrap();
        assert_eq!(report.annotated_video_url, Some(format!("/results/{name}")));
        assert!(manager.active_session().is_none());
    }

    #[test]
    fn unavailable_source_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(Some(5), 1000.0),
            ScriptedDetector::always(&[]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        let err = manager
            .start_file_session(Path::new("missing.mp4"))
            .unwrap_err();
        assert!(matches!(err, SessionError::SourceUnavailable(_)));
        assert!(manager.active_session().is_none());
        assert!(matches!(
            manager.wait_file_session(Duration::from_millis(1)),
            SessionWait::Idle
        ));
    }

    #[test]
    fn inference_failure_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = ScriptedDetector::always(&["fire"]);
        detector.fail_on = Some(2);
        let manager = manager_with(
            TestMedia::new(None, 1000.0),
            detector,
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("clip.mp4")).unwrap();
        let summary = wait_finished(&manager);
        assert_eq!(summary.exit, ExitReason::InferenceFailure);
        assert_eq!(summary.frames_processed, 2);
        assert!(summary.output_path.is_some());
    }

    #[test]
    fn writer_failure_keeps_processing() {
        let dir = tempfile::tempdir().unwrap();
        let mut media = TestMedia::new(Some(3), 1000.0);
        media.fail_writer = true;
        let manager = manager_with(
            media,
            ScriptedDetector::always(&[]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("clip.mp4")).unwrap();
        let summary = wait_finished(&manager);
        assert_eq!(summary.exit, ExitReason::Exhausted);
        assert_eq!(summary.frames_processed, 3);
        assert_eq!(summary.frames_written, 0);
        assert_eq!(summary.output_path, None);
        assert_eq!(manager.stop_file_session().unwrap().annotated_video_path, None);
    }

    #[test]
    fn persistent_fire_triggers_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(CountingPlayer::default());
        let manager = manager_with(
            TestMedia::new(Some(6), 1000.0),
            ScriptedDetector::always(&["fire"]),
            player.clone(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("clip.mp4")).unwrap();
        wait_finished(&manager);
        wait_for(|| !manager.alarms().is_active());
        let played = player.played.lock().unwrap();
        assert!(!played.is_empty());
        assert!(played.iter().all(|hazard| *hazard == Hazard::Fire));
    }

    #[test]
    fn four_frames_of_fire_never_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(CountingPlayer::default());
        let manager = manager_with(
            TestMedia::new(Some(4), 1000.0),
            ScriptedDetector::always(&["fire"]),
            player.clone(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("clip.mp4")).unwrap();
        wait_finished(&manager);
        assert!(player.played.lock().unwrap().is_empty());
    }

    #[test]
    fn restart_stops_previous_session_before_new_writes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(None, 200.0),
            ScriptedDetector::always(&[]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        let first = manager.start_file_session(Path::new("a.mp4")).unwrap();
        wait_for(|| manager.frames().read().is_some());

        let second = manager.start_file_session(Path::new("b.mp4")).unwrap();
        assert_ne!(first, second);
        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            if let Some(snapshot) = manager.frames().read() {
                assert_eq!(snapshot.session_id, second);
            }
        }
        assert_eq!(manager.active_session(), Some(second));

        let summary = manager.cancel_file_session().unwrap().unwrap();
        assert_eq!(summary.session_id, second);
        assert_eq!(summary.exit, ExitReason::Cancelled);
    }

    #[test]
    fn stop_wakes_a_paced_loop_early() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(None, 0.5),
            ScriptedDetector::always(&[]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("slow.mp4")).unwrap();
        wait_for(|| manager.frames().read().is_some());

        let started = Instant::now();
        let summary = manager.cancel_file_session().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(summary.exit, ExitReason::Cancelled);
        assert_eq!(summary.frames_processed, 1);
    }

    #[test]
    fn cancelled_session_finalizes_every_processed_frame() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(None, 1000.0),
            ScriptedDetector::always(&["fire"]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        manager.start_file_session(Path::new("endless.mkv")).unwrap();
        wait_for(|| {
            manager
                .frames()
                .read()
                .map_or(false, |snapshot| snapshot.frame_number >= 3)
        });

        let summary = manager.cancel_file_session().unwrap().unwrap();
        assert_eq!(summary.exit, ExitReason::Cancelled);
        assert!(summary.frames_processed >= 3);
        assert_eq!(summary.frames_written, summary.frames_processed);

        let output = summary.output_path.unwrap();
        assert!(output.to_string_lossy().ends_with(".mkv"));
        let recorded = std::fs::read_to_string(&output).unwrap();
        assert_eq!(recorded, summary.frames_written.to_string());
    }

    #[test]
    fn active_session_does_not_wait_on_a_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(None, 1000.0),
            SlowDetector(Duration::from_millis(800)),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        let id = manager.start_file_session(Path::new("slow.mp4")).unwrap();
        wait_for(|| manager.frames().read().is_some());

        thread::scope(|scope| {
            let stopper = scope.spawn(|| manager.cancel_file_session());
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            assert_eq!(manager.active_session(), Some(id));
            assert!(started.elapsed() < Duration::from_millis(50));

            let summary = stopper.join().unwrap().unwrap().unwrap();
            assert_eq!(summary.exit, ExitReason::Cancelled);
        });
        assert!(manager.active_session().is_none());
    }

    #[test]
    fn stop_timeout_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(None, 1000.0),
            SlowDetector(Duration::from_millis(400)),
            Arc::default(),
            settings(dir.path(), Duration::from_millis(20)),
        );
        let first = manager.start_file_session(Path::new("a.mp4")).unwrap();
        wait_for(|| manager.frames().read().is_some());

        let err = manager.start_file_session(Path::new("b.mp4")).unwrap_err();
        assert!(matches!(err, SessionError::StopTimeout(_)));
        assert_eq!(manager.frames().read().unwrap().session_id, first);

        wait_for(|| manager.active_session().is_none());
        let summary = manager.cancel_file_session().unwrap().unwrap();
        assert_eq!(summary.session_id, first);
        assert_eq!(summary.exit, ExitReason::Cancelled);
    }

    #[test]
    fn output_persistence_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let media = TestMedia::new(Some(2), 1000.0);
        let writes = media.writes.clone();
        let mut settings = settings(dir.path(), Duration::from_secs(5));
        settings.persist_output = false;
        let manager = manager_with(media, ScriptedDetector::always(&[]), Arc::default(), settings);
        manager.start_file_session(Path::new("clip.mp4")).unwrap();
        let summary = wait_finished(&manager);
        assert_eq!(summary.output_path, None);
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn camera_flag_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(
            TestMedia::new(Some(1), 1000.0),
            ScriptedDetector::always(&[]),
            Arc::default(),
            settings(dir.path(), Duration::from_secs(5)),
        );
        assert!(!manager.camera_active());
        manager.start_camera();
        assert!(manager.camera_flag().load(Ordering::SeqCst));
        manager.shutdown();
        assert!(!manager.camera_active());
        let source = manager.open_camera().unwrap();
        assert_eq!(
            source.properties(),
            SourceProperties {
                fps: 0.0,
                width: 16,
                height: 12,
            }
        );
    }

    #[test]
    fn cancel_token_reports_drop_of_handle() {
        let (mut handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!token.wait(Duration::from_millis(1)));
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait(Duration::from_secs(5)));
    }
}
