//! Contracts between the kernel and its downstream consumers.
//!
//! Presentation behavior (drawing, dialogs, text panels, image writing)
//! lives outside this crate. What lives here is the data flowing across
//! that boundary:
//! - `FrameSink` / `ProcessedFrame`: per-frame delivery from the stream
//!   controller
//! - `TriggerPolicy` / `SaveDecision`: which saves a frame's detections
//!   should fire
//! - `DetectionMetadata`: the JSON schema written next to triggered saves

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::detect::DetectionRecord;
use crate::frame::Frame;

/// Per-frame payload delivered to sinks: the frame, its validated
/// detections, the frame's index in the stream, and how long detection took.
pub struct ProcessedFrame<'a> {
    pub frame: &'a Frame,
    pub detections: &'a [DetectionRecord],
    pub frame_index: u64,
    pub elapsed_ms: f64,
}

/// A consumer of processed frames.
///
/// Sinks are invoked on the acquisition worker, in registration order, and
/// must not block for long; nothing a sink does feeds back into the kernel.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, processed: &ProcessedFrame<'_>);
}

// ----------------------------------------------------------------------------
// Save-decision policy
// ----------------------------------------------------------------------------

/// Which saves should fire for one frame's detections.
#[derive(Debug, Default, PartialEq)]
pub struct SaveDecision {
    /// Auto-save wants the frame (any detection present).
    pub auto_save: bool,
    /// Detections matching the trigger class set, empty when the trigger
    /// should not fire.
    pub triggered: Vec<DetectionRecord>,
}

/// Save policy for auto-save and conditional (trigger) save.
///
/// The two decisions are independent: a frame can fire both on the same
/// pass. Trigger matching is by class name.
#[derive(Clone, Debug, Default)]
pub struct TriggerPolicy {
    pub auto_save_enabled: bool,
    pub trigger_enabled: bool,
    pub trigger_classes: HashSet<String>,
}

impl TriggerPolicy {
    pub fn evaluate(&self, detections: &[DetectionRecord]) -> SaveDecision {
        let auto_save = self.auto_save_enabled && !detections.is_empty();
        let triggered = if self.trigger_enabled {
            detections
                .iter()
                .filter(|d| self.trigger_classes.contains(&d.class_name))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        SaveDecision {
            auto_save,
            triggered,
        }
    }
}

// ----------------------------------------------------------------------------
// Triggered-save metadata schema
// ----------------------------------------------------------------------------

/// Metadata written alongside a triggered save. The field names and shapes
/// are a wire contract with external tooling; box coordinates are rounded
/// to whole pixels.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMetadata {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Base name of the saved image.
    pub image_file: String,
    pub total_detections: usize,
    pub detections: Vec<DetectionMeta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMeta {
    pub class_name: String,
    pub class_id: usize,
    pub confidence: f32,
    pub bounding_box: BoundingBoxMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBoxMeta {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl DetectionMetadata {
    /// Build the metadata record for one saved image.
    pub fn new(image_file: &str, detections: &[DetectionRecord]) -> anyhow::Result<Self> {
        Ok(Self {
            timestamp: crate::now_s()?,
            image_file: image_file.to_string(),
            total_detections: detections.len(),
            detections: detections.iter().map(DetectionMeta::from_record).collect(),
        })
    }
}

impl DetectionMeta {
    fn from_record(record: &DetectionRecord) -> Self {
        Self {
            class_name: record.class_name.clone(),
            class_id: record.class_id,
            confidence: record.confidence,
            bounding_box: BoundingBoxMeta {
                x: record.x.round() as i32,
                y: record.y.round() as i32,
                width: record.width.round() as i32,
                height: record.height.round() as i32,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class_name: &str, class_id: usize) -> DetectionRecord {
        DetectionRecord {
            class_id,
            class_name: class_name.to_string(),
            confidence: 0.8,
            x: 10.4,
            y: 20.6,
            width: 30.0,
            height: 40.0,
        }
    }

    #[test]
    fn metadata_serializes_with_the_contract_keys() -> anyhow::Result<()> {
        let metadata = DetectionMetadata::new("trigger_person.png", &[record("person", 0)])?;
        let value = serde_json::to_value(&metadata)?;

        assert!(value.get("timestamp").is_some());
        assert_eq!(value["imageFile"], "trigger_person.png");
        assert_eq!(value["totalDetections"], 1);
        let detection = &value["detections"][0];
        assert_eq!(detection["className"], "person");
        assert_eq!(detection["classId"], 0);
        let bounding_box = &detection["boundingBox"];
        assert_eq!(bounding_box["x"], 10);
        assert_eq!(bounding_box["y"], 21);
        assert_eq!(bounding_box["width"], 30);
        assert_eq!(bounding_box["height"], 40);
        Ok(())
    }

    #[test]
    fn trigger_fires_only_on_matching_classes() {
        let policy = TriggerPolicy {
            auto_save_enabled: false,
            trigger_enabled: true,
            trigger_classes: ["person".to_string()].into_iter().collect(),
        };
        let decision = policy.evaluate(&[record("person", 0), record("car", 2)]);
        assert!(!decision.auto_save);
        assert_eq!(decision.triggered.len(), 1);
        assert_eq!(decision.triggered[0].class_name, "person");
    }

    #[test]
    fn auto_save_and_trigger_are_independent() {
        let policy = TriggerPolicy {
            auto_save_enabled: true,
            trigger_enabled: true,
            trigger_classes: ["person".to_string()].into_iter().collect(),
        };
        let decision = policy.evaluate(&[record("person", 0)]);
        assert!(decision.auto_save);
        assert_eq!(decision.triggered.len(), 1);

        // No detections: neither fires.
        let decision = policy.evaluate(&[]);
        assert!(!decision.auto_save);
        assert!(decision.triggered.is_empty());
    }
}
