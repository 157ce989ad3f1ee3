use ml_core::Detection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) bbox: Option<[f32; 4]>,
}

impl From<&Detection> for DetectionSummary {
    fn from(detection: &Detection) -> Self {
        Self {
            class: detection.class_label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
        }
    }
}

pub(crate) fn summarize(detections: &[Detection]) -> Vec<DetectionSummary> {
    detections.iter().map(DetectionSummary::from).collect()
}

/// Payload of one server-sent event on the processing stream.
#[derive(Serialize)]
pub(crate) struct FrameEvent<'a> {
    pub(crate) frame: &'a str,
    pub(crate) detections: &'a [DetectionSummary],
    pub(crate) timestamp: f64,
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) session_id: u64,
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) detections: &'a [DetectionSummary],
}

#[derive(Debug, Deserialize)]
pub(crate) struct VideoProcessingRequest {
    pub(crate) video_path: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) video_path: Option<String>,
}

impl StatusResponse {
    pub(crate) fn new(status: &'static str) -> Self {
        Self {
            status,
            video_path: None,
        }
    }
}

/// Result of stopping (or polling after) a file session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct StopReport {
    pub(crate) status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) annotated_video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) annotated_video_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PredictionResponse {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) confidence: f32,
    pub(crate) timestamp: String,
    pub(crate) preprocess_ms: f64,
    pub(crate) inference_ms: f64,
    pub(crate) postprocess_ms: f64,
    /// `[height, width]` of the submitted image.
    pub(crate) shape: [u32; 2],
    pub(crate) detections: Vec<DetectionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) result_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct VideoUploadResponse {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) video_path: String,
    pub(crate) timestamp: String,
    pub(crate) message: &'static str,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) file_session: Option<u64>,
    pub(crate) camera_active: bool,
    pub(crate) alarm_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_omit_missing_boxes() {
        let dets = vec![
            Detection::new("fire", 0.5, Some([1.0, 2.0, 3.0, 4.0])),
            Detection::new("smoke", 0.25, None),
        ];
        let json = serde_json::to_value(summarize(&dets)).unwrap();
        assert_eq!(json[0]["class"], "fire");
        assert_eq!(json[0]["bbox"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert!(json[1].get("bbox").is_none());
    }

    #[test]
    fn stop_report_omits_absent_output() {
        let report = StopReport {
            status: "video processing stopped",
            annotated_video_url: None,
            annotated_video_path: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "video processing stopped" }));
    }
}
