#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceBackend, InputTensor};

/// Tract-based backend for ONNX inference.
///
/// Loads a local model file and runs the forward pass on CPU. Model inputs
/// are addressed positionally; input 0 corresponds to the detection heads'
/// `images` input.
pub struct TractBackend {
    model: TypedSimplePlan<TypedModel>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference with a
    /// fixed `[1, 3, height, width]` input shape.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        use_accelerator: bool,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if use_accelerator {
            // tract runs on CPU only; the flag is honored by other backends.
            log::warn!("tract backend does not support hardware acceleration, using CPU");
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn run(&mut self, input: &InputTensor) -> Result<Vec<f32>> {
        if input.width() != self.width || input.height() != self.height {
            return Err(anyhow!(
                "input tensor {}x{} does not match model input {}x{}",
                input.width(),
                input.height(),
                self.width,
                self.height
            ));
        }

        let array = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            input.data().to_vec(),
        )
        .context("input tensor shape mismatch")?;

        let outputs = self
            .model
            .run(tvec!(array.into_tensor().into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(view.iter().copied().collect())
    }
}
