//! Detection engine: preprocessing, decoding, and suppression.
//!
//! The engine owns one inference handle and the resolved label list for a
//! single model variant. `detect` is the whole contract: frame in, validated
//! `DetectionRecord`s out. The engine is reentrant but not thread-safe for
//! concurrent calls sharing one handle; callers serialize per instance.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::detect::backend::{InferenceBackend, InputTensor};
use crate::detect::backends::StubBackend;
#[cfg(feature = "backend-tract")]
use crate::detect::backends::TractBackend;
use crate::detect::config::{ModelConfig, ModelVariant, TensorLayout};
use crate::detect::labels;
use crate::detect::record::DetectionRecord;
use crate::frame::Frame;
use crate::VisionError;

/// Letterbox padding value, the conventional neutral gray.
const PAD_GRAY: u8 = 114;

/// Upper bound on candidates entering NMS. Noisy outputs can clear the
/// confidence threshold thousands of times; the cap bounds worst-case
/// suppression cost.
const MAX_CANDIDATES: usize = 50;

/// One loaded detection model.
pub struct DetectionEngine {
    config: ModelConfig,
    labels: Vec<String>,
    backend: Option<Box<dyn InferenceBackend>>,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("config", &self.config)
            .field("labels", &self.labels)
            .field("backend_loaded", &self.backend.is_some())
            .finish()
    }
}

impl DetectionEngine {
    /// Load a model described by `config`.
    ///
    /// A `stub://` model path selects the scripted backend (with synthesized
    /// labels when the label path is also `stub://`); anything else must
    /// exist on disk and is loaded through the ONNX backend. Fails with
    /// `MissingResource` when the artifact or label file is absent.
    pub fn load(config: ModelConfig) -> Result<Self> {
        let stub_model = config.model_path.to_string_lossy().starts_with("stub://");

        let labels = if stub_model && config.labels_path.to_string_lossy().starts_with("stub://") {
            labels::synthetic_labels(config.class_count)
        } else {
            labels::load_labels(&config.labels_path)?
        };
        if labels.len() != config.class_count {
            return Err(anyhow!(
                "label file {} lists {} classes, model expects {}",
                config.labels_path.display(),
                labels.len(),
                config.class_count
            ));
        }

        let backend: Box<dyn InferenceBackend> = if stub_model {
            Box::new(StubBackend::silent(config.num_attributes()))
        } else {
            if !config.model_path.exists() {
                return Err(VisionError::MissingResource(format!(
                    "model artifact not found: {}",
                    config.model_path.display()
                ))
                .into());
            }
            #[cfg(feature = "backend-tract")]
            {
                Box::new(TractBackend::new(
                    &config.model_path,
                    config.input_width,
                    config.input_height,
                    config.use_accelerator,
                )?)
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                return Err(anyhow!(
                    "loading ONNX models requires the backend-tract feature"
                ));
            }
        };

        log::info!(
            "loaded {} model from {} ({} classes, {}x{} input)",
            config.variant,
            config.model_path.display(),
            config.class_count,
            config.input_width,
            config.input_height
        );
        Ok(Self::with_backend(config, labels, backend))
    }

    /// Assemble an engine from parts. The caller guarantees the label list
    /// matches `config.class_count`.
    pub fn with_backend(
        config: ModelConfig,
        labels: Vec<String>,
        backend: Box<dyn InferenceBackend>,
    ) -> Self {
        Self {
            config,
            labels,
            backend: Some(backend),
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.config.variant
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.config.confidence_threshold
    }

    /// Adjust the live confidence threshold.
    ///
    /// Fails with `OutOfRange` unless `threshold` is within `[0, 1]`; only
    /// subsequent `detect` calls observe the new value.
    pub fn set_confidence_threshold(&mut self, threshold: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(VisionError::OutOfRange(format!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ))
            .into());
        }
        self.config.confidence_threshold = threshold;
        Ok(())
    }

    /// Release the inference handle. Subsequent `detect` calls fail with
    /// `InvalidState` until the engine is reloaded.
    pub fn dispose(&mut self) {
        self.backend = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    /// Run detection on a frame.
    ///
    /// Returns an empty vector (never an error) when nothing clears the
    /// confidence threshold. Errors are per-frame recoverable for the caller:
    /// an empty frame, a released handle, a backend failure, or output the
    /// configured layout cannot explain.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionRecord>> {
        if frame.is_empty() {
            return Err(VisionError::EmptyFrame.into());
        }
        let backend = self.backend.as_mut().ok_or_else(|| {
            VisionError::InvalidState("no inference handle loaded".to_string())
        })?;

        let input = letterbox(frame, self.config.input_width, self.config.input_height)?;
        let output = backend.run(&input)?;

        let candidates = self.decode(&output, frame.width(), frame.height())?;
        let capped = cap_candidates(candidates);
        Ok(non_max_suppression(capped, self.config.nms_iou_threshold))
    }

    /// Decode the flat output buffer into thresholded, validated candidates.
    ///
    /// A single routine serves both layouts; only the indexing differs,
    /// selected once from the model configuration.
    fn decode(
        &self,
        output: &[f32],
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<DetectionRecord>> {
        let num_attributes = self.config.num_attributes();
        if output.is_empty() || output.len() % num_attributes != 0 {
            return Err(VisionError::MalformedOutput(format!(
                "output length {} is not a multiple of {} attributes",
                output.len(),
                num_attributes
            ))
            .into());
        }
        let num_detections = output.len() / num_attributes;
        let layout = self.config.layout();

        let at = |detection: usize, attribute: usize| -> f32 {
            match layout {
                TensorLayout::ChannelMajor => output[attribute * num_detections + detection],
                TensorLayout::DetectionMajor => output[detection * num_attributes + attribute],
            }
        };

        let scale_x = frame_width as f32 / self.config.input_width as f32;
        let scale_y = frame_height as f32 / self.config.input_height as f32;

        let mut candidates = Vec::new();
        for i in 0..num_detections {
            let center_x = at(i, 0);
            let center_y = at(i, 1);
            let width = at(i, 2);
            let height = at(i, 3);

            // Single-class models carry the confidence directly in attribute
            // 4; multi-class models get an argmax over the class slots.
            let (confidence, class_id) = if self.config.class_count == 1 {
                (at(i, 4), 0)
            } else {
                let mut best = 0.0f32;
                let mut best_class = 0usize;
                for c in 0..self.config.class_count {
                    let score = at(i, 4 + c);
                    if score > best {
                        best = score;
                        best_class = c;
                    }
                }
                (best, best_class)
            };

            if confidence < self.config.confidence_threshold {
                continue;
            }
            if class_id >= self.labels.len() {
                log::debug!("candidate {} names class {} outside label table", i, class_id);
                continue;
            }

            let record = DetectionRecord {
                class_id,
                class_name: self.labels[class_id].clone(),
                confidence,
                x: (center_x - width / 2.0) * scale_x,
                y: (center_y - height / 2.0) * scale_y,
                width: width * scale_x,
                height: height * scale_y,
            };
            if !record.is_valid(frame_width, frame_height) {
                log::debug!("candidate {} rejected: box outside frame bounds", i);
                continue;
            }
            candidates.push(record);
        }
        Ok(candidates)
    }
}

/// Letterbox-resize a frame onto the model's input canvas.
///
/// The frame is scaled by `min(input_w / w, input_h / h)`, centered on a
/// gray canvas, and normalized per channel to `[0, 1]` in planar order.
fn letterbox(frame: &Frame, input_width: u32, input_height: u32) -> Result<InputTensor> {
    let scale = (input_width as f32 / frame.width() as f32)
        .min(input_height as f32 / frame.height() as f32);
    let new_width = ((frame.width() as f32 * scale) as u32).max(1);
    let new_height = ((frame.height() as f32 * scale) as u32).max(1);

    let source = frame.as_image()?;
    let resized = imageops::resize(&source, new_width, new_height, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(input_width, input_height, Rgb([PAD_GRAY; 3]));
    let offset_x = (input_width - new_width) / 2;
    let offset_y = (input_height - new_height) / 2;
    imageops::replace(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    let plane = (input_width * input_height) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (idx, pixel) in canvas.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        data[idx] = r as f32 / 255.0;
        data[plane + idx] = g as f32 / 255.0;
        data[2 * plane + idx] = b as f32 / 255.0;
    }
    Ok(InputTensor::new(data, input_width, input_height))
}

/// Bound the candidate set entering NMS to the highest-confidence 50.
fn cap_candidates(mut candidates: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
    if candidates.len() > MAX_CANDIDATES {
        log::warn!(
            "{} candidates above threshold, keeping top {}",
            candidates.len(),
            MAX_CANDIDATES
        );
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates.truncate(MAX_CANDIDATES);
    }
    candidates
}

/// Greedy per-class non-maximum suppression.
///
/// Candidates are visited in descending confidence order; a candidate is
/// dropped when an already-kept box of the same class overlaps it at or
/// above `iou_threshold`.
fn non_max_suppression(
    mut candidates: Vec<DetectionRecord>,
    iou_threshold: f32,
) -> Vec<DetectionRecord> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<DetectionRecord> = Vec::new();
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) >= iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::labels::synthetic_labels;

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data: Vec<u8> = std::iter::repeat(rgb)
            .take((width * height) as usize)
            .flatten()
            .collect();
        Frame::from_rgb8(data, width, height).unwrap()
    }

    fn object_config() -> ModelConfig {
        let mut config = ModelConfig::object_detection("stub://assets");
        config.model_path = "stub://object".into();
        config.labels_path = "stub://labels".into();
        config
    }

    fn face_config() -> ModelConfig {
        let mut config = ModelConfig::face_detection("stub://assets");
        config.model_path = "stub://face".into();
        config.labels_path = "stub://labels".into();
        config
    }

    fn object_engine(output: Vec<f32>) -> DetectionEngine {
        let config = object_config();
        let labels = synthetic_labels(config.class_count);
        DetectionEngine::with_backend(config, labels, Box::new(StubBackend::with_output(output)))
    }

    fn face_engine(output: Vec<f32>) -> DetectionEngine {
        let config = face_config();
        let labels = synthetic_labels(config.class_count);
        DetectionEngine::with_backend(config, labels, Box::new(StubBackend::with_output(output)))
    }

    /// A face-layout candidate row: `[cx, cy, w, h, conf]`.
    fn face_candidates(rows: &[[f32; 5]]) -> Vec<f32> {
        rows.iter().flatten().copied().collect()
    }

    #[test]
    fn channel_major_decode_rescales_to_original_frame() -> Result<()> {
        // 84 attributes x 8400 candidates, [attr][detection] order. One
        // candidate at slot 0: box (320, 320, 100, 100), class 4 at 0.9.
        let num_detections = 8400;
        let mut output = vec![0.0f32; 84 * num_detections];
        output[0] = 320.0;
        output[num_detections] = 320.0;
        output[2 * num_detections] = 100.0;
        output[3 * num_detections] = 100.0;
        output[(4 + 4) * num_detections] = 0.9;

        let mut engine = object_engine(output);
        let frame = solid_frame(1280, 1280, [40, 40, 40]);
        let records = engine.detect(&frame)?;

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.class_id, 4);
        assert_eq!(r.class_name, "class_4");
        assert!((r.confidence - 0.9).abs() < 1e-6);
        assert!((r.x - 540.0).abs() < 1e-3);
        assert!((r.y - 540.0).abs() < 1e-3);
        assert!((r.width - 200.0).abs() < 1e-3);
        assert!((r.height - 200.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn detection_major_decode_reads_confidence_from_attribute_four() -> Result<()> {
        let output = face_candidates(&[[320.0, 320.0, 100.0, 100.0, 0.9]]);
        let mut engine = face_engine(output);
        let frame = solid_frame(1280, 1280, [40, 40, 40]);
        let records = engine.detect(&frame)?;

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.class_id, 0);
        assert!((r.confidence - 0.9).abs() < 1e-6);
        assert!((r.x - 540.0).abs() < 1e-3);
        assert!((r.width - 200.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn every_returned_confidence_clears_the_threshold() -> Result<()> {
        let output = face_candidates(&[
            [100.0, 100.0, 40.0, 40.0, 0.49],
            [300.0, 300.0, 40.0, 40.0, 0.51],
            [500.0, 500.0, 40.0, 40.0, 0.95],
        ]);
        let mut engine = face_engine(output);
        let frame = solid_frame(640, 640, [40, 40, 40]);
        let records = engine.detect(&frame)?;

        assert_eq!(records.len(), 2);
        for r in &records {
            assert!(r.confidence >= engine.confidence_threshold());
        }
        Ok(())
    }

    #[test]
    fn nms_keeps_only_the_strongest_of_overlapping_boxes() -> Result<()> {
        // Two near-identical boxes (IoU well above 0.45) and one far away.
        let output = face_candidates(&[
            [320.0, 320.0, 100.0, 100.0, 0.9],
            [325.0, 320.0, 100.0, 100.0, 0.8],
            [100.0, 100.0, 50.0, 50.0, 0.7],
        ]);
        let mut engine = face_engine(output);
        let frame = solid_frame(640, 640, [40, 40, 40]);
        let records = engine.detect(&frame)?;

        assert_eq!(records.len(), 2);
        assert!((records[0].confidence - 0.9).abs() < 1e-6);
        assert!((records[1].confidence - 0.7).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn boxes_below_iou_threshold_both_survive() -> Result<()> {
        let output = face_candidates(&[
            [100.0, 100.0, 50.0, 50.0, 0.9],
            [300.0, 300.0, 50.0, 50.0, 0.8],
        ]);
        let mut engine = face_engine(output);
        let frame = solid_frame(640, 640, [40, 40, 40]);
        assert_eq!(engine.detect(&frame)?.len(), 2);
        Ok(())
    }

    #[test]
    fn candidate_cap_keeps_the_fifty_most_confident() -> Result<()> {
        // 200 disjoint boxes on a grid, confidences strictly increasing.
        let mut rows = Vec::new();
        for i in 0..200usize {
            let cx = 20.0 + (i % 20) as f32 * 30.0;
            let cy = 20.0 + (i / 20) as f32 * 30.0;
            rows.push([cx, cy, 10.0, 10.0, 0.5 + i as f32 * 0.002]);
        }
        let mut engine = face_engine(face_candidates(&rows));
        let frame = solid_frame(640, 640, [40, 40, 40]);
        let records = engine.detect(&frame)?;

        assert_eq!(records.len(), 50);
        let min_kept = records
            .iter()
            .map(|r| r.confidence)
            .fold(f32::INFINITY, f32::min);
        assert!((min_kept - (0.5 + 150.0 * 0.002)).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn boxes_outside_the_frame_are_rejected_not_clamped() -> Result<()> {
        // Centered at the input edge: scaled box crosses the frame border.
        let output = face_candidates(&[[635.0, 320.0, 100.0, 100.0, 0.9]]);
        let mut engine = face_engine(output);
        let frame = solid_frame(640, 640, [40, 40, 40]);
        assert!(engine.detect(&frame)?.is_empty());
        Ok(())
    }

    #[test]
    fn threshold_mutation_affects_subsequent_calls_only_when_in_range() -> Result<()> {
        let output = face_candidates(&[[320.0, 320.0, 100.0, 100.0, 0.6]]);
        let mut engine = face_engine(output);
        let frame = solid_frame(640, 640, [40, 40, 40]);

        assert_eq!(engine.detect(&frame)?.len(), 1);
        engine.set_confidence_threshold(0.7)?;
        assert!(engine.detect(&frame)?.is_empty());

        let err = engine.set_confidence_threshold(1.1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::OutOfRange(_))
        ));
        // Rejected synchronously, no mutation.
        assert!((engine.confidence_threshold() - 0.7).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn garbled_output_is_a_per_frame_error() {
        let mut engine = face_engine(vec![0.0; 7]);
        let frame = solid_frame(640, 640, [40, 40, 40]);
        let err = engine.detect(&frame).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::MalformedOutput(_))
        ));
    }

    #[test]
    fn empty_frame_is_rejected() {
        let mut engine = face_engine(vec![0.0; 5]);
        let frame = Frame::from_rgb8(Vec::new(), 0, 0).unwrap();
        let err = engine.detect(&frame).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::EmptyFrame)
        ));
    }

    #[test]
    fn disposed_engine_reports_invalid_state() {
        let mut engine = face_engine(vec![0.0; 5]);
        engine.dispose();
        assert!(!engine.is_loaded());
        let frame = solid_frame(640, 640, [40, 40, 40]);
        let err = engine.detect(&frame).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::InvalidState(_))
        ));
    }

    #[test]
    fn letterbox_pads_with_gray_and_centers_the_image() -> Result<()> {
        // 320x640 frame into a 640x640 input: scale 1, 160px side bars.
        let frame = solid_frame(320, 640, [255, 0, 0]);
        let tensor = letterbox(&frame, 640, 640)?;

        assert_eq!(tensor.data().len(), 3 * 640 * 640);
        let pad = PAD_GRAY as f32 / 255.0;
        // Left bar is padding on all channels.
        assert!((tensor.at(0, 320, 0) - pad).abs() < 1e-6);
        assert!((tensor.at(1, 320, 0) - pad).abs() < 1e-6);
        // Center carries the (red) image.
        assert!((tensor.at(0, 320, 320) - 1.0).abs() < 1e-6);
        assert!(tensor.at(1, 320, 320).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn loading_a_stub_model_synthesizes_labels() -> Result<()> {
        let engine = DetectionEngine::load(object_config())?;
        assert_eq!(engine.labels().len(), 80);
        assert!(engine.is_loaded());
        Ok(())
    }

    #[test]
    fn loading_a_missing_model_is_a_missing_resource() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let labels_path = dir.path().join("coco.names");
        let names: String = (0..80).map(|i| format!("class{}\n", i)).collect();
        std::fs::write(&labels_path, names)?;

        let mut config = ModelConfig::object_detection(dir.path());
        config.labels_path = labels_path;
        // Labels resolve, the model artifact does not.
        let err = DetectionEngine::load(config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::MissingResource(_))
        ));
        Ok(())
    }
}
