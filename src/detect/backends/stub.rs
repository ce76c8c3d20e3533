use anyhow::Result;

use crate::detect::backend::{InferenceBackend, InputTensor};

/// Scripted backend for tests and `stub://` model paths.
///
/// Returns a fixed output buffer on every call, ignoring the input tensor.
/// The default script is one all-zero candidate, which decodes to nothing.
pub struct StubBackend {
    output: Vec<f32>,
}

impl StubBackend {
    /// A backend that never detects anything: a single candidate whose
    /// confidence is zero.
    pub fn silent(num_attributes: usize) -> Self {
        Self {
            output: vec![0.0; num_attributes],
        }
    }

    /// A backend replaying the given flat output buffer.
    pub fn with_output(output: Vec<f32>) -> Self {
        Self { output }
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn run(&mut self, _input: &InputTensor) -> Result<Vec<f32>> {
        Ok(self.output.clone())
    }
}
