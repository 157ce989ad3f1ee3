//! Detection adapter boundary shared by the firewatch processing engine.
//!
//! The engine only depends on [`ObjectDetector`]; the TorchScript YOLO
//! implementation is available with the `with-tch` feature.

mod detection;
#[cfg(feature = "with-tch")]
pub mod detector;

pub use detection::{
    Detection, DetectionOutput, InferenceTiming, ObjectDetector, iou, non_max_suppression,
};

#[cfg(feature = "with-tch")]
pub use tch;
