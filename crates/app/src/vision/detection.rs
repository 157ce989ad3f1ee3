//! Shared detector handle used by file sessions, camera feeds and still images.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::anyhow;
use ml_core::{DetectionOutput, ObjectDetector};
use video_ingest::Frame;

use crate::vision::error::SessionError;

pub type SharedModel = Arc<Mutex<Box<dyn ObjectDetector>>>;

/// A model plus the confidence threshold one caller applies to it.
#[derive(Clone)]
pub struct DetectionAdapter {
    model: SharedModel,
    confidence: f32,
}

impl DetectionAdapter {
    pub fn new(model: SharedModel, confidence: f32) -> Self {
        Self { model, confidence }
    }

    pub fn with_confidence(&self, confidence: f32) -> Self {
        Self {
            model: self.model.clone(),
            confidence,
        }
    }

    pub fn detect(&self, frame: &Frame) -> Result<DetectionOutput, SessionError> {
        let started = Instant::now();
        let mut model = self
            .model
            .lock()
            .map_err(|_| SessionError::Inference(anyhow!("detector lock poisoned")))?;
        let output = model
            .detect(&frame.data, frame.width, frame.height, self.confidence)
            .map_err(SessionError::Inference)?;
        drop(model);
        metrics::histogram!("firewatch_inference_seconds").record(started.elapsed().as_secs_f64());
        Ok(output)
    }
}

pub fn share(detector: impl ObjectDetector + 'static) -> SharedModel {
    let boxed: Box<dyn ObjectDetector> = Box::new(detector);
    Arc::new(Mutex::new(boxed))
}

#[cfg(feature = "with-tch")]
pub fn load_model(settings: &crate::vision::config::DetectorSettings) -> anyhow::Result<SharedModel> {
    use anyhow::Context;
    use ml_core::{detector::TorchScriptDetector, tch::Device};

    let device = if settings.use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = TorchScriptDetector::new(
        &settings.model_path,
        device,
        settings.input_size,
        settings.class_names.clone(),
    )
    .with_context(|| format!("failed to load model {}", settings.model_path.display()))?;
    tracing::info!(
        "Loaded detector {} on {:?}",
        settings.model_path.display(),
        detector.device()
    );
    Ok(share(detector))
}

#[cfg(not(feature = "with-tch"))]
pub fn load_model(settings: &crate::vision::config::DetectorSettings) -> anyhow::Result<SharedModel> {
    anyhow::bail!(
        "cannot load {}: firewatch was built without the `with-tch` feature",
        settings.model_path.display()
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use anyhow::Result;
    use ml_core::{Detection, DetectionOutput, InferenceTiming, ObjectDetector};

    /// Replays a fixed list of per-frame detections, cycling when exhausted.
    pub struct ScriptedDetector {
        pub script: Vec<Vec<Detection>>,
        pub calls: usize,
        pub fail_on: Option<usize>,
    }

    impl ScriptedDetector {
        pub fn new(script: Vec<Vec<Detection>>) -> Self {
            Self {
                script,
                calls: 0,
                fail_on: None,
            }
        }

        pub fn always(labels: &[&str]) -> Self {
            let frame = labels
                .iter()
                .map(|label| Detection::new(*label, 0.9, Some([1.0, 1.0, 6.0, 6.0])))
                .collect();
            Self::new(vec![frame])
        }
    }

    impl ObjectDetector for ScriptedDetector {
        fn detect(
            &mut self,
            _bgr: &[u8],
            _width: i32,
            _height: i32,
            confidence: f32,
        ) -> Result<DetectionOutput> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on == Some(call) {
                anyhow::bail!("scripted failure on call {call}");
            }
            let detections = if self.script.is_empty() {
                Vec::new()
            } else {
                self.script[call % self.script.len()]
                    .iter()
                    .filter(|det| det.confidence >= confidence)
                    .cloned()
                    .collect()
            };
            Ok(DetectionOutput {
                detections,
                timing: InferenceTiming {
                    preprocess_ms: 1.04,
                    inference_ms: 5.26,
                    postprocess_ms: 0.51,
                },
            })
        }
    }
}
