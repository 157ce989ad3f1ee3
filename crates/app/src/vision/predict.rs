//! Still image prediction and upload intake.

use std::{fs, path::Path};

use chrono::Local;
use image::ImageFormat;
use ml_core::Detection;
use tracing::info;
use video_ingest::Frame;

use crate::vision::{
    annotation::{annotate, rgb_to_bgr},
    data::{PredictionResponse, VideoUploadResponse, summarize},
    detection::DetectionAdapter,
    error::SessionError,
    hazard::{Hazard, HazardLabels},
    results::{ResultsDir, artifact_timestamp, dotted_extension, is_video_extension, result_url},
};

/// Response to an uploaded file.
#[derive(Debug)]
pub(crate) enum UploadOutcome {
    Video(VideoUploadResponse),
    Image(PredictionResponse),
}

/// Store an upload as `input_<ts><ext>`; videos are returned for a later
/// processing session, anything else is predicted immediately.
pub(crate) fn handle_upload(
    filename: &str,
    body: &[u8],
    detector: &DetectionAdapter,
    labels: &HazardLabels,
    results: &ResultsDir,
) -> Result<UploadOutcome, SessionError> {
    if body.is_empty() {
        return Err(SessionError::InvalidRequest("empty upload".into()));
    }
    results.ensure()?;
    let ext = dotted_extension(filename);
    let timestamp = artifact_timestamp();
    let input = results.artifact_path("input", &timestamp, &ext);
    fs::write(&input, body)?;
    info!("stored upload {filename} as {}", input.display());

    if is_video_extension(&ext) {
        return Ok(UploadOutcome::Video(VideoUploadResponse {
            kind: "video_uploaded",
            video_path: input.display().to_string(),
            timestamp: iso_timestamp(),
            message: "Video uploaded. Use /start_video_processing to begin.",
        }));
    }

    predict_image(body, &ext, &timestamp, detector, labels, results).map(UploadOutcome::Image)
}

/// Detect on one encoded image, save an annotated copy and classify the scene.
pub(crate) fn predict_image(
    encoded: &[u8],
    ext: &str,
    timestamp: &str,
    detector: &DetectionAdapter,
    labels: &HazardLabels,
    results: &ResultsDir,
) -> Result<PredictionResponse, SessionError> {
    let rgb = image::load_from_memory(encoded)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    let frame = Frame::bgr(rgb_to_bgr(rgb.as_raw()), width as i32, height as i32);

    let output = detector.detect(&frame)?;
    let (kind, confidence) = classify(&output.detections, labels);
    let timing = output.timing.rounded();

    results.ensure()?;
    let (format, ext) = match ext {
        ".jpg" | ".jpeg" => (ImageFormat::Jpeg, ext),
        ".bmp" => (ImageFormat::Bmp, ext),
        ".png" => (ImageFormat::Png, ext),
        _ => (ImageFormat::Png, ".png"),
    };
    let annotated_path = results.artifact_path("annotated", timestamp, ext);
    annotate(&frame, &output.detections, labels)
        .map_err(|err| SessionError::Internal(format!("{err:#}")))?
        .save_with_format(&annotated_path, format)?;

    Ok(PredictionResponse {
        kind,
        confidence,
        timestamp: iso_timestamp(),
        preprocess_ms: timing.preprocess_ms,
        inference_ms: timing.inference_ms,
        postprocess_ms: timing.postprocess_ms,
        shape: [height, width],
        detections: summarize(&output.detections),
        result_url: result_url(&annotated_path),
    })
}

/// Scene label from exact class matches; confidence is the best matching score.
pub(crate) fn classify(detections: &[Detection], labels: &HazardLabels) -> (&'static str, f32) {
    let best = |hazard: Hazard| {
        detections
            .iter()
            .filter(|det| labels.is_exactly(hazard, &det.class_label))
            .map(|det| det.confidence)
            .reduce(f32::max)
    };
    match (best(Hazard::Fire), best(Hazard::Smoke)) {
        (Some(fire), Some(smoke)) => ("fire_and_smoke", fire.max(smoke)),
        (Some(fire), None) => ("fire", fire),
        (None, Some(smoke)) => ("smoke", smoke),
        (None, None) => ("clear", 0.0),
    }
}

/// Read an image from disk and predict it (CLI `predict`).
pub(crate) fn predict_file(
    path: &Path,
    detector: &DetectionAdapter,
    labels: &HazardLabels,
    results: &ResultsDir,
) -> Result<PredictionResponse, SessionError> {
    let encoded = fs::read(path)?;
    let ext = dotted_extension(&path.to_string_lossy());
    predict_image(&encoded, &ext, &artifact_timestamp(), detector, labels, results)
}

fn iso_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::vision::detection::{share, testing::ScriptedDetector};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn adapter(labels: &[&str]) -> DetectionAdapter {
        DetectionAdapter::new(share(ScriptedDetector::always(labels)), 0.4)
    }

    #[test]
    fn classification_uses_exact_labels_and_best_score() {
        let labels = HazardLabels::default();
        let dets = vec![
            Detection::new("fire", 0.5, None),
            Detection::new("Fire", 0.7, None),
            Detection::new("smoke", 0.6, None),
            Detection::new("wildfire", 0.99, None),
        ];
        assert_eq!(classify(&dets, &labels), ("fire_and_smoke", 0.7));
        assert_eq!(classify(&dets[2..3], &labels), ("smoke", 0.6));
        assert_eq!(classify(&dets[3..], &labels), ("clear", 0.0));
        assert_eq!(classify(&[], &labels), ("clear", 0.0));
    }

    #[test]
    fn image_upload_is_predicted_and_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let results = ResultsDir::new(dir.path());
        let outcome = handle_upload(
            "scene.png",
            &png_bytes(20, 10),
            &adapter(&["fire"]),
            &HazardLabels::default(),
            &results,
        )
        .unwrap();

        let UploadOutcome::Image(prediction) = outcome else {
            panic!("expected an image prediction");
        };
        assert_eq!(prediction.kind, "fire");
        assert_eq!(prediction.shape, [10, 20]);
        assert_eq!(prediction.inference_ms, 5.3);
        let url = prediction.result_url.unwrap();
        assert!(url.starts_with("/results/annotated_") && url.ends_with(".png"));
        let saved = dir.path().join(url.trim_start_matches("/results/"));
        assert!(saved.is_file());

        let inputs = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("input_"))
            .count();
        assert_eq!(inputs, 1);
    }

    #[test]
    fn video_upload_is_stored_for_later() {
        let dir = tempfile::tempdir().unwrap();
        let results = ResultsDir::new(dir.path());
        let outcome = handle_upload(
            "clip.MP4",
            b"not really a video",
            &adapter(&[]),
            &HazardLabels::default(),
            &results,
        )
        .unwrap();
        let UploadOutcome::Video(upload) = outcome else {
            panic!("expected a video upload");
        };
        assert_eq!(upload.kind, "video_uploaded");
        assert!(upload.video_path.ends_with(".mp4"));
        assert!(Path::new(&upload.video_path).is_file());
    }

    #[test]
    fn undecodable_image_is_a_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = handle_upload(
            "photo.jpg",
            b"garbage",
            &adapter(&[]),
            &HazardLabels::default(),
            &ResultsDir::new(dir.path()),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Image(_)));
    }

    #[test]
    fn unknown_extension_saves_png() {
        let dir = tempfile::tempdir().unwrap();
        let prediction = predict_image(
            &png_bytes(4, 4),
            "",
            "20240101_000000",
            &adapter(&[]),
            &HazardLabels::default(),
            &ResultsDir::new(dir.path()),
        )
        .unwrap();
        assert_eq!(prediction.kind, "clear");
        assert_eq!(
            prediction.result_url.as_deref(),
            Some("/results/annotated_20240101_000000.png")
        );
    }
}
