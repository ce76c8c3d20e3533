//! Per-model-variant configuration.
//!
//! A `ModelConfig` is created once at load time from a static preset and is
//! immutable afterwards, with one exception: the confidence threshold is
//! live-adjustable through the owning engine.

use std::path::{Path, PathBuf};

/// Supported model variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    /// General object detection (YOLOv8-class, 80 COCO classes).
    ObjectDetection,
    /// Face detection (single-class YOLOv12-face-class model).
    FaceDetection,
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelVariant::ObjectDetection => write!(f, "object-detection"),
            ModelVariant::FaceDetection => write!(f, "face-detection"),
        }
    }
}

/// Physical ordering of the model's flat output buffer.
///
/// Both layouts describe `numDetections` candidates of `4 + classCount`
/// attributes; they differ only in which dimension varies fastest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, attributes, detections]`: attribute `a` of candidate `i` sits at
    /// `a * num_detections + i`. YOLOv8-style detection heads.
    ChannelMajor,
    /// `[1, detections, attributes]`: attribute `a` of candidate `i` sits at
    /// `i * num_attributes + a`. YOLOv12-face-style heads.
    DetectionMajor,
}

/// Parameters for one loaded model.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    /// Path to the ONNX artifact. `stub://` selects the scripted backend.
    pub model_path: PathBuf,
    /// Newline-delimited label file, one class name per line.
    pub labels_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    /// Minimum confidence for a candidate to survive decoding, `[0, 1]`.
    pub confidence_threshold: f32,
    /// IoU at or above which a lower-confidence same-class box is suppressed.
    pub nms_iou_threshold: f32,
    /// Number of class slots in the model output.
    pub class_count: usize,
    /// Request hardware acceleration from the backend when available.
    pub use_accelerator: bool,
}

impl ModelConfig {
    /// Preset for the primary object-detection model.
    pub fn object_detection<P: AsRef<Path>>(assets_dir: P) -> Self {
        let assets = assets_dir.as_ref();
        Self {
            variant: ModelVariant::ObjectDetection,
            model_path: assets.join("yolov8n.onnx"),
            labels_path: assets.join("coco.names"),
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.45,
            class_count: 80,
            use_accelerator: false,
        }
    }

    /// Preset for the optional face-detection model.
    pub fn face_detection<P: AsRef<Path>>(assets_dir: P) -> Self {
        let assets = assets_dir.as_ref();
        Self {
            variant: ModelVariant::FaceDetection,
            model_path: assets.join("yolov12n-face.onnx"),
            labels_path: assets.join("face.names"),
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.45,
            class_count: 1,
            use_accelerator: false,
        }
    }

    /// Output layout, fixed by the variant.
    ///
    /// Selecting the layout here (once, at configuration time) is what lets
    /// the engine run a single decode routine for every variant.
    pub fn layout(&self) -> TensorLayout {
        match self.variant {
            ModelVariant::ObjectDetection => TensorLayout::ChannelMajor,
            ModelVariant::FaceDetection => TensorLayout::DetectionMajor,
        }
    }

    /// Attributes per candidate: 4 box coordinates plus one score per class.
    pub fn num_attributes(&self) -> usize {
        4 + self.class_count
    }
}
