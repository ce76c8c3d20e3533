//! Vision Kernel
//!
//! This crate implements the core of a real-time object-detection pipeline:
//! frames are pulled from a capture source (camera, video file, or still
//! image), run through a YOLO-style detection engine, and forwarded to sinks
//! as geometrically and semantically validated detections.
//!
//! # Architecture
//!
//! Two subsystems carry the real algorithmic and concurrency content:
//!
//! 1. **Detection Engine** (`detect`): letterbox preprocessing, tensor-layout
//!    aware decoding of raw model output, confidence filtering, and per-class
//!    non-maximum suppression. One engine is loaded per model variant and
//!    held in a `ModelRegistry` that tracks the active variant.
//! 2. **Stream Controller** (`stream`): a dedicated acquisition worker with
//!    pause/resume/seek/stop transport semantics. The capture handle is the
//!    only shared mutable resource and is serialized behind a single lock.
//!
//! Presentation concerns (drawing, dialogs, on-screen text) are external
//! collaborators. The kernel exposes narrow contracts to them: the
//! `FrameSink` trait, the `ProcessedFrame` payload, and the triggered-save
//! metadata schema.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB frame buffer
//! - `detect`: engine, registry, backends, model configuration
//! - `stream`: capture sources and the stream controller
//! - `sink`: sink trait and data contracts for downstream consumers
//! - `stats`: session-level detection statistics
//! - `config`: daemon configuration (file + environment)

pub mod config;
pub mod detect;
pub mod frame;
pub mod sink;
pub mod stats;
pub mod stream;

pub use config::{ModelSettings, SourceSettings, VisiondConfig};
pub use detect::{
    DetectionEngine, DetectionRecord, InferenceBackend, InputTensor, ModelConfig, ModelRegistry,
    ModelVariant, StubBackend, TensorLayout,
};
pub use frame::Frame;
pub use sink::{
    BoundingBoxMeta, DetectionMeta, DetectionMetadata, FrameSink, ProcessedFrame, SaveDecision,
    TriggerPolicy,
};
pub use stats::SessionStats;
pub use stream::{
    CaptureSource, SourceConfig, StreamController, StreamPosition, StreamState, StreamStats,
};

// -------------------- Error Taxonomy --------------------

/// Typed failures surfaced by the kernel.
///
/// Load-time and control errors propagate to the caller; per-frame errors are
/// logged and swallowed at the frame boundary by the acquisition loop. The
/// variants are deliberately coarse: callers match on the kind, the message
/// carries the specifics.
#[derive(Clone, Debug)]
pub enum VisionError {
    /// Operation requires state the component is not in (e.g. detect on a
    /// disposed engine, start on a running stream).
    InvalidState(String),
    /// A numeric parameter fell outside its documented range.
    OutOfRange(String),
    /// A required model artifact or label file is absent.
    MissingResource(String),
    /// The requested model variant has no loaded engine.
    NotLoaded(String),
    /// The capture resource could not be opened or repositioned.
    SourceUnavailable(String),
    /// The frame handed to the engine carried no pixels.
    EmptyFrame,
    /// The inference backend returned an output buffer the configured
    /// layout cannot explain.
    MalformedOutput(String),
}

impl std::fmt::Display for VisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisionError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            VisionError::OutOfRange(msg) => write!(f, "out of range: {}", msg),
            VisionError::MissingResource(msg) => write!(f, "missing resource: {}", msg),
            VisionError::NotLoaded(msg) => write!(f, "model not loaded: {}", msg),
            VisionError::SourceUnavailable(msg) => write!(f, "source unavailable: {}", msg),
            VisionError::EmptyFrame => write!(f, "frame is empty"),
            VisionError::MalformedOutput(msg) => write!(f, "malformed model output: {}", msg),
        }
    }
}

impl std::error::Error for VisionError {}

/// Seconds since the Unix epoch, for metadata timestamps.
pub(crate) fn now_s() -> anyhow::Result<u64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs())
}
