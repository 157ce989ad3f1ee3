//! FFmpeg subprocess backend.
//!
//! Decoding pipes `bgr24` rawvideo out of an `ffmpeg` child process; encoding
//! pipes annotated frames back into another child that muxes them into the
//! requested container. Stream properties come from `ffprobe`.

use std::{
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    camera::device_path,
    synthetic::SyntheticSource,
    types::{
        CaptureError, Frame, FrameFormat, MediaBackend, SourceProperties, VideoSink, VideoSource,
        frame_len,
    },
};

/// Frame rate assumed when neither the caller nor the container provides one.
pub const FALLBACK_FPS: f64 = 30.0;

/// Media backend driving the `ffmpeg`/`ffprobe` binaries found on `PATH`.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegBackend {
    pub fn with_binaries(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        cmd
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_file(&self, path: &Path) -> Result<Box<dyn VideoSource>, CaptureError> {
        let uri = path.to_string_lossy().into_owned();
        if uri.starts_with("stub://") {
            return Ok(Box::new(SyntheticSource::from_uri(&uri)?));
        }
        if !path.is_file() {
            return Err(CaptureError::Open { uri });
        }

        let properties = probe(&self.ffprobe, path)?;
        let mut cmd = self.base_command();
        cmd.arg("-i")
            .arg(path)
            .arg("-an")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        let source = FfmpegSource::spawn(cmd, &uri, properties)?;
        debug!(
            "Opened {uri} ({}x{} @ {:.2} fps)",
            properties.width, properties.height, properties.fps
        );
        Ok(Box::new(source))
    }

    fn open_device(
        &self,
        index: i32,
        target_size: (i32, i32),
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        let device = device_path(index);
        if !Path::new(&device).exists() {
            return Err(CaptureError::Open { uri: device });
        }

        let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
        let mut cmd = self.base_command();
        cmd.arg("-f")
            .arg("video4linux2")
            .arg("-i")
            .arg(&device)
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");

        let properties = SourceProperties {
            fps: 0.0,
            width: target_size.0,
            height: target_size.1,
        };
        Ok(Box::new(FfmpegSource::spawn(cmd, &device, properties)?))
    }

    fn create_writer(
        &self,
        path: &Path,
        fps: f64,
        size: (i32, i32),
    ) -> Result<Box<dyn VideoSink>, CaptureError> {
        let fps = if fps > 0.0 { fps } else { FALLBACK_FPS };
        let mut cmd = self.base_command();
        cmd.arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-s")
            .arg(format!("{}x{}", size.0, size.1))
            .arg("-r")
            .arg(format!("{fps:.3}"))
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-q:v")
            .arg("5")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(path);
        Ok(Box::new(FfmpegWriter::spawn(cmd, path, size)?))
    }
}

/// Decoder child process yielding packed BGR frames.
pub struct FfmpegSource {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    properties: SourceProperties,
    uri: String,
}

impl FfmpegSource {
    fn spawn(
        mut cmd: Command,
        uri: &str,
        properties: SourceProperties,
    ) -> Result<Self, CaptureError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|err| {
            warn!("video-ingest: failed to spawn ffmpeg for {uri}: {err}");
            CaptureError::Open {
                uri: uri.to_string(),
            }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;
        Ok(Self {
            child: Some(child),
            stdout: Some(stdout),
            properties,
            uri: uri.to_string(),
        })
    }
}

impl VideoSource for FfmpegSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let len = frame_len(
            self.properties.width,
            self.properties.height,
            FrameFormat::Bgr8,
        );
        let mut buffer = vec![0u8; len];
        if !fill_frame(stdout, &mut buffer)? {
            debug!("End of stream reached for {}", self.uri);
            self.close();
            return Ok(None);
        }
        Ok(Some(Frame {
            data: buffer,
            width: self.properties.width,
            height: self.properties.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }))
    }

    fn properties(&self) -> SourceProperties {
        self.properties
    }

    fn close(&mut self) {
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read exactly one frame. Returns `false` on end of stream, including a
/// truncated trailing frame.
fn fill_frame(reader: &mut impl Read, buffer: &mut [u8]) -> Result<bool, CaptureError> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => {
                if filled > 0 {
                    warn!(
                        "video-ingest: dropping truncated frame ({filled} of {} bytes)",
                        buffer.len()
                    );
                }
                return Ok(false);
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

/// Encoder child process fed with packed BGR frames over stdin.
pub struct FfmpegWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    path: PathBuf,
    size: (i32, i32),
    frames_written: u64,
}

impl FfmpegWriter {
    fn spawn(mut cmd: Command, path: &Path, size: (i32, i32)) -> Result<Self, CaptureError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdin")))?;
        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            path: path.to_path_buf(),
            size,
            frames_written: 0,
        })
    }

    fn shutdown(&mut self) -> Result<(), CaptureError> {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                return Err(CaptureError::Other(anyhow!(
                    "ffmpeg exited with {status} while finalising {}",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }
}

impl VideoSink for FfmpegWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        if (frame.width, frame.height) != self.size {
            return Err(CaptureError::FrameSize {
                expected: frame_len(self.size.0, self.size.1, FrameFormat::Bgr8),
                actual: frame.data.len(),
            });
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CaptureError::Other(anyhow!("writer already finished")))?;
        stdin.write_all(&frame.data)?;
        self.frames_written += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf, CaptureError> {
        self.shutdown()?;
        Ok(self.path.clone())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("video-ingest: {err}");
        }
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<i32>,
    height: Option<i32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn probe(ffprobe: &Path, path: &Path) -> Result<SourceProperties, CaptureError> {
    let uri = path.to_string_lossy().into_owned();
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,avg_frame_rate,r_frame_rate")
        .arg("-of")
        .arg("json")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| CaptureError::Probe {
            uri: uri.clone(),
            reason: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(CaptureError::Open { uri });
    }
    parse_probe_output(&uri, &output.stdout)
}

pub(crate) fn parse_probe_output(uri: &str, raw: &[u8]) -> Result<SourceProperties, CaptureError> {
    let parsed: ProbeOutput = serde_json::from_slice(raw).map_err(|err| CaptureError::Probe {
        uri: uri.to_string(),
        reason: err.to_string(),
    })?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| CaptureError::Probe {
            uri: uri.to_string(),
            reason: "no video stream".to_string(),
        })?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(CaptureError::Probe {
            uri: uri.to_string(),
            reason: "video stream has no dimensions".to_string(),
        });
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);
    Ok(SourceProperties { fps, width, height })
}

/// Parse ffprobe rationals such as `30000/1001`; `0/0` yields `None`.
pub(crate) fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = match raw.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (raw.trim().parse::<f64>().ok()?, 1.0),
    };
    if den <= 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frame_rate_rationals() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn probe_output_prefers_average_rate() {
        let raw = br#"{"streams":[{"width":640,"height":360,"avg_frame_rate":"24/1","r_frame_rate":"48/1"}]}"#;
        let props = parse_probe_output("clip.mp4", raw).unwrap();
        assert_eq!(props.width, 640);
        assert_eq!(props.height, 360);
        assert_eq!(props.fps, 24.0);
    }

    #[test]
    fn probe_output_without_rate_reports_zero_fps() {
        let raw = br#"{"streams":[{"width":32,"height":16,"avg_frame_rate":"0/0"}]}"#;
        let props = parse_probe_output("still.mkv", raw).unwrap();
        assert_eq!(props.fps, 0.0);
    }

    #[test]
    fn probe_output_without_streams_is_an_error() {
        let err = parse_probe_output("audio.mp3", br#"{"streams":[]}"#).unwrap_err();
        assert!(matches!(err, CaptureError::Probe { .. }));
    }

    #[test]
    fn fill_frame_detects_clean_and_truncated_eof() {
        let mut buffer = [0u8; 4];
        let mut reader = Cursor::new(vec![1u8, 2, 3, 4, 5, 6]);
        assert!(fill_frame(&mut reader, &mut buffer).unwrap());
        assert_eq!(buffer, [1, 2, 3, 4]);
        assert!(!fill_frame(&mut reader, &mut buffer).unwrap());
        assert!(!fill_frame(&mut reader, &mut buffer).unwrap());
    }

    #[test]
    fn missing_file_is_reported_as_open_failure() {
        let backend = FfmpegBackend::default();
        let err = backend
            .open_file(Path::new("/definitely/not/here.mp4"))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Open { .. }));
    }

    #[test]
    fn stub_uri_bypasses_ffmpeg() {
        let backend = FfmpegBackend::default();
        let mut source = backend.open_file(Path::new("stub://8x4@10/2")).unwrap();
        assert_eq!(source.properties().fps, 10.0);
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
    }
}
