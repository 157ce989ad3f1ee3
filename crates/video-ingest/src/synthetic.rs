//! Deterministic generated frames for dry runs and tests.
//!
//! `stub://<width>x<height>[@<fps>][/<frames>]` opens a synthetic source; a
//! missing frame count means the stream never ends.

use anyhow::anyhow;

use crate::types::{CaptureError, Frame, SourceProperties, VideoSource};

pub struct SyntheticSource {
    properties: SourceProperties,
    remaining: Option<u64>,
    produced: u64,
    closed: bool,
}

impl SyntheticSource {
    pub fn new(width: i32, height: i32, fps: f64, frames: Option<u64>) -> Self {
        Self {
            properties: SourceProperties { fps, width, height },
            remaining: frames,
            produced: 0,
            closed: false,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, CaptureError> {
        let params = uri
            .strip_prefix("stub://")
            .ok_or_else(|| CaptureError::Open {
                uri: uri.to_string(),
            })?;
        let invalid = || CaptureError::Other(anyhow!("invalid synthetic source {uri:?}"));

        let (head, frames) = match params.split_once('/') {
            Some((head, count)) => (head, Some(count.parse::<u64>().map_err(|_| invalid())?)),
            None => (params, None),
        };
        let (size, fps) = match head.split_once('@') {
            Some((size, fps)) => (size, fps.parse::<f64>().map_err(|_| invalid())?),
            None => (head, 0.0),
        };
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;
        let width = width.parse::<i32>().map_err(|_| invalid())?;
        let height = height.parse::<i32>().map_err(|_| invalid())?;
        if width <= 0 || height <= 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height, fps, frames))
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced
    }
}

impl VideoSource for SyntheticSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        let SourceProperties { width, height, .. } = self.properties;
        let shade = (self.produced % 256) as u8;
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(shade);
                data.push((x % 256) as u8);
                data.push((y % 256) as u8);
            }
        }
        self.produced += 1;
        Ok(Some(Frame::bgr(data, width, height)))
    }

    fn properties(&self) -> SourceProperties {
        self.properties
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
