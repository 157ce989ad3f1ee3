//! Camera device helpers and the OpenCV-backed capture backend.
//!
//! The OpenCV backend is only compiled with the `with-opencv` feature; the
//! device index parsing is shared with the FFmpeg backend.

/// Parse a `/dev/videoX` style URI (or a bare index) and return the index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// V4L device node for a camera index.
pub fn device_path(index: i32) -> String {
    format!("/dev/video{index}")
}

#[cfg(feature = "with-opencv")]
pub use cv::OpenCvBackend;

#[cfg(feature = "with-opencv")]
mod cv {
    use std::path::{Path, PathBuf};

    use anyhow::anyhow;
    use opencv::{
        core::{self, Mat, MatTraitConstManual},
        prelude::*,
        videoio::{self, VideoCapture, VideoWriter},
    };
    use tracing::warn;

    use crate::types::{
        CaptureError, Frame, MediaBackend, SourceProperties, VideoSink, VideoSource,
    };

    fn cv_err(err: opencv::Error) -> CaptureError {
        CaptureError::Other(anyhow!("opencv: {err}"))
    }

    /// Media backend built on OpenCV's `videoio` module.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct OpenCvBackend;

    impl MediaBackend for OpenCvBackend {
        fn open_file(&self, path: &Path) -> Result<Box<dyn VideoSource>, CaptureError> {
            let uri = path.to_string_lossy().into_owned();
            let cap = open_video_capture(&uri, None)?;
            Ok(Box::new(OpenCvSource::new(cap, None)?))
        }

        fn open_device(
            &self,
            index: i32,
            target_size: (i32, i32),
        ) -> Result<Box<dyn VideoSource>, CaptureError> {
            let mut cap = open_video_capture(&super::device_path(index), Some(index))?;
            configure_camera(&mut cap, target_size);
            Ok(Box::new(OpenCvSource::new(cap, Some(target_size))?))
        }

        fn create_writer(
            &self,
            path: &Path,
            fps: f64,
            size: (i32, i32),
        ) -> Result<Box<dyn VideoSink>, CaptureError> {
            let fps = if fps > 0.0 { fps } else { crate::ffmpeg::FALLBACK_FPS };
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v').map_err(cv_err)?;
            let writer = VideoWriter::new(
                &path.to_string_lossy(),
                fourcc,
                fps,
                core::Size {
                    width: size.0,
                    height: size.1,
                },
                true,
            )
            .map_err(cv_err)?;
            if !writer.is_opened().map_err(cv_err)? {
                return Err(CaptureError::Open {
                    uri: path.to_string_lossy().into_owned(),
                });
            }
            Ok(Box::new(OpenCvWriter {
                writer: Some(writer),
                path: path.to_path_buf(),
                frames_written: 0,
            }))
        }
    }

    struct OpenCvSource {
        cap: Option<VideoCapture>,
        properties: SourceProperties,
        resize_to: Option<(i32, i32)>,
    }

    impl OpenCvSource {
        fn new(cap: VideoCapture, resize_to: Option<(i32, i32)>) -> Result<Self, CaptureError> {
            let fps = cap.get(videoio::CAP_PROP_FPS).map_err(cv_err)?;
            let (width, height) = match resize_to {
                Some(size) => size,
                None => (
                    cap.get(videoio::CAP_PROP_FRAME_WIDTH).map_err(cv_err)? as i32,
                    cap.get(videoio::CAP_PROP_FRAME_HEIGHT).map_err(cv_err)? as i32,
                ),
            };
            Ok(Self {
                cap: Some(cap),
                properties: SourceProperties {
                    fps: if fps.is_finite() { fps.max(0.0) } else { 0.0 },
                    width,
                    height,
                },
                resize_to,
            })
        }
    }

    impl VideoSource for OpenCvSource {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            let Some(cap) = self.cap.as_mut() else {
                return Ok(None);
            };
            let mut frame = Mat::default();
            if !cap.read(&mut frame).map_err(cv_err)? || frame.empty() {
                return Ok(None);
            }
            let mut scratch = Mat::default();
            let working = match self.resize_to {
                Some((w, h)) if frame.cols() != w || frame.rows() != h => {
                    opencv::imgproc::resize(
                        &frame,
                        &mut scratch,
                        core::Size {
                            width: w,
                            height: h,
                        },
                        0.0,
                        0.0,
                        opencv::imgproc::INTER_LINEAR,
                    )
                    .map_err(cv_err)?;
                    &scratch
                }
                _ => &frame,
            };
            let data = working.data_bytes().map_err(cv_err)?.to_vec();
            Ok(Some(Frame::bgr(data, working.cols(), working.rows())))
        }

        fn properties(&self) -> SourceProperties {
            self.properties
        }

        fn close(&mut self) {
            if let Some(mut cap) = self.cap.take() {
                let _ = cap.release();
            }
        }
    }

    struct OpenCvWriter {
        writer: Option<VideoWriter>,
        path: PathBuf,
        frames_written: u64,
    }

    impl VideoSink for OpenCvWriter {
        fn write(&mut self, frame: &Frame) -> Result<(), CaptureError> {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| CaptureError::Other(anyhow!("writer already finished")))?;
            let flat = Mat::from_slice(&frame.data).map_err(cv_err)?;
            let mat = flat.reshape(3, frame.height).map_err(cv_err)?;
            writer.write(&mat).map_err(cv_err)?;
            self.frames_written += 1;
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames_written
        }

        fn finish(mut self: Box<Self>) -> Result<PathBuf, CaptureError> {
            if let Some(mut writer) = self.writer.take() {
                writer.release().map_err(cv_err)?;
            }
            Ok(self.path.clone())
        }
    }

    impl Drop for OpenCvWriter {
        fn drop(&mut self) {
            if let Some(mut writer) = self.writer.take() {
                let _ = writer.release();
            }
        }
    }

    /// Attempt to open a camera input either by index or URI.
    fn open_video_capture(uri: &str, index: Option<i32>) -> Result<VideoCapture, CaptureError> {
        if let Some(index) = index {
            for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
                match VideoCapture::new(index, backend) {
                    Ok(cap) => {
                        if cap.is_opened().map_err(cv_err)? {
                            return Ok(cap);
                        }
                    }
                    Err(err) => {
                        warn!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                    }
                }
            }
        }

        match VideoCapture::from_file(uri, videoio::CAP_ANY) {
            Ok(cap) => {
                if cap.is_opened().map_err(cv_err)? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("video-ingest: failed to open {uri}: {err}");
            }
        }

        Err(CaptureError::Open {
            uri: uri.to_string(),
        })
    }

    /// Apply resolution and preferred pixel format; failures are ignored.
    fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32)) {
        if let Ok(mjpg) = VideoWriter::fourcc('M', 'J', 'P', 'G') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
        }
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    }
}
