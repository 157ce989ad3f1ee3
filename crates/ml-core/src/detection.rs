use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Single detection returned by a detector, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    /// `(x1, y1, x2, y2)`; absent for classifiers that do not localise.
    pub bbox: Option<[f32; 4]>,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox: Option<[f32; 4]>) -> Self {
        Self {
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    /// Case-insensitive substring match against a class keyword.
    pub fn label_contains(&self, keyword: &str) -> bool {
        self.class_label
            .to_lowercase()
            .contains(&keyword.to_lowercase())
    }
}

/// Per-call latency breakdown in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceTiming {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

impl InferenceTiming {
    /// Copy with every phase clamped non-negative and rounded to one decimal.
    pub fn rounded(self) -> Self {
        fn round1(value: f64) -> f64 {
            (value.max(0.0) * 10.0).round() / 10.0
        }
        Self {
            preprocess_ms: round1(self.preprocess_ms),
            inference_ms: round1(self.inference_ms),
            postprocess_ms: round1(self.postprocess_ms),
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.preprocess_ms + self.inference_ms + self.postprocess_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionOutput {
    pub detections: Vec<Detection>,
    pub timing: InferenceTiming,
}

/// Opaque detection model: one packed BGR frame in, detections out.
pub trait ObjectDetector: Send {
    fn detect(
        &mut self,
        bgr: &[u8],
        width: i32,
        height: i32,
        confidence: f32,
    ) -> Result<DetectionOutput>;
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = 0;
    for index in 0..detections.len() {
        let suppressed = (0..kept).any(|prev| {
            detections[prev].class_label == detections[index].class_label
                && match (detections[prev].bbox, detections[index].bbox) {
                    (Some(a), Some(b)) => iou(&a, &b) > iou_threshold,
                    _ => false,
                }
        });
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
