//! Model registry.
//!
//! Holds at most one loaded engine per model variant and tracks which
//! variant is active. Switching can only land on a loaded variant, so an
//! active-model switch never leaves the system without a usable engine.

use std::collections::HashMap;

use anyhow::Result;

use crate::detect::config::{ModelConfig, ModelVariant};
use crate::detect::engine::DetectionEngine;
use crate::VisionError;

pub struct ModelRegistry {
    engines: HashMap<ModelVariant, DetectionEngine>,
    active: ModelVariant,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
            active: ModelVariant::ObjectDetection,
        }
    }

    /// Load (or reload) the engine for `config.variant`.
    ///
    /// Any prior engine for the variant is disposed before the new load is
    /// attempted, so a failed reload leaves the variant absent. The active
    /// variant is untouched either way; `active_engine` simply reports
    /// nothing until a successful load.
    pub fn load_model(&mut self, config: ModelConfig) -> Result<()> {
        let variant = config.variant;
        if let Some(mut old) = self.engines.remove(&variant) {
            old.dispose();
            log::info!("disposed previous {} engine before reload", variant);
        }
        let engine = DetectionEngine::load(config)?;
        self.engines.insert(variant, engine);
        Ok(())
    }

    /// Make `variant` the active model.
    ///
    /// Fails with `NotLoaded` when the variant has no engine; the registry
    /// state is unchanged on failure.
    pub fn switch_model(&mut self, variant: ModelVariant) -> Result<()> {
        if !self.engines.contains_key(&variant) {
            return Err(VisionError::NotLoaded(variant.to_string()).into());
        }
        self.active = variant;
        log::info!("active model switched to {}", variant);
        Ok(())
    }

    pub fn active_variant(&self) -> ModelVariant {
        self.active
    }

    /// The engine for the active variant, if one is loaded.
    pub fn active_engine(&self) -> Option<&DetectionEngine> {
        self.engines.get(&self.active)
    }

    pub fn active_engine_mut(&mut self) -> Option<&mut DetectionEngine> {
        self.engines.get_mut(&self.active)
    }

    pub fn is_loaded(&self, variant: ModelVariant) -> bool {
        self.engines.contains_key(&variant)
    }

    pub fn loaded_variants(&self) -> Vec<ModelVariant> {
        self.engines.keys().copied().collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModelRegistry {
    fn drop(&mut self) {
        // Teardown disposes every loaded engine.
        for engine in self.engines.values_mut() {
            engine.dispose();
        }
    }
}
