use std::{convert::TryFrom, path::Path, time::Instant};

use anyhow::{Result, bail};
use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::detection::{Detection, DetectionOutput, InferenceTiming, ObjectDetector, non_max_suppression};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

/// TorchScript-backed YOLO detector (Ultralytics `[1, 4 + classes, N]` export).
pub struct TorchScriptDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    class_names: Vec<String>,
}

impl TorchScriptDetector {
    /// Load a TorchScript module on `device`; `input_size` is (width, height).
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        class_names: Vec<String>,
    ) -> Result<Self> {
        let mut module = tch::CModule::load_on_device(model_path, device)?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            class_names,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Converts a packed BGR frame into a normalized, resized RGB NCHW tensor.
    fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                bgr.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([1, height as i64, width as i64, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            .to_kind(Kind::Float)
            / 255.0;

        Ok(if (width as i64, height as i64) != (in_w, in_h) {
            tensor.upsample_bilinear2d([in_h, in_w], false, None, None)
        } else {
            tensor
        })
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl ObjectDetector for TorchScriptDetector {
    fn detect(
        &mut self,
        bgr: &[u8],
        width: i32,
        height: i32,
        confidence: f32,
    ) -> Result<DetectionOutput> {
        let started = Instant::now();
        let input = self.bgr_to_tensor(bgr, width, height)?;
        let preprocessed = Instant::now();

        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let inferred = Instant::now();

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (cx,cy,w,h,score), got {}",
                shape[1]
            );
        }

        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(
            &output
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .squeeze_dim(0)
                .permute([1, 0])
                .contiguous(),
        )?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w as f32;
        let scale_y = height as f32 / in_h as f32;
        let max_x = (width - 1).max(0) as f32;
        let max_y = (height - 1).max(0) as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            else {
                continue;
            };
            if score < confidence {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];
            detections.push(Detection::new(self.class_name(class_id), score, Some(bbox)));
        }

        non_max_suppression(&mut detections, NMS_IOU_THRESHOLD);
        detections.truncate(MAX_DETECTIONS);
        let finished = Instant::now();

        let timing = InferenceTiming {
            preprocess_ms: preprocessed.duration_since(started).as_secs_f64() * 1e3,
            inference_ms: inferred.duration_since(preprocessed).as_secs_f64() * 1e3,
            postprocess_ms: finished.duration_since(inferred).as_secs_f64() * 1e3,
        };
        debug!(
            "detector: {} detection(s) in {:.1} ms",
            detections.len(),
            timing.total_ms()
        );

        Ok(DetectionOutput { detections, timing })
    }
}
