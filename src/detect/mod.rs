mod backend;
mod backends;
mod config;
mod engine;
mod labels;
mod record;
mod registry;

pub use backend::{InferenceBackend, InputTensor};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use config::{ModelConfig, ModelVariant, TensorLayout};
pub use engine::DetectionEngine;
pub use labels::load_labels;
pub use record::DetectionRecord;
pub use registry::ModelRegistry;
