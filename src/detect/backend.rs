//! Inference backend boundary.
//!
//! The engine owns preprocessing and postprocessing; the backend owns only
//! the forward pass. The contract is narrow: the engine hands over a planar
//! `[1, 3, H, W]` float tensor and reads back one flat float buffer whose
//! layout the engine (not the backend) interprets.

use anyhow::Result;

/// Planar float tensor of shape `[1, 3, height, width]`, channel-first,
/// values normalized to `[0, 1]`.
#[derive(Clone, Debug)]
pub struct InputTensor {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl InputTensor {
    pub(crate) fn new(data: Vec<f32>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), 3 * width as usize * height as usize);
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Flattened `[1, 3, H, W]` data, channel-major.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Value at `[0, channel, y, x]`.
    pub fn at(&self, channel: usize, y: u32, x: u32) -> f32 {
        let plane = (self.width * self.height) as usize;
        self.data[channel * plane + y as usize * self.width as usize + x as usize]
    }
}

/// Backend trait for running a model's forward pass.
///
/// Implementations load one model artifact each and must treat the input
/// tensor as read-only. A backend is not required to be thread-safe:
/// the engine serializes calls per instance.
pub trait InferenceBackend: Send {
    /// Backend identifier, for logs.
    fn name(&self) -> &'static str;

    /// Run inference and return the model's first output, flattened.
    fn run(&mut self, input: &InputTensor) -> Result<Vec<f32>>;
}
