//! Daemon configuration.
//!
//! Layering, lowest priority first: built-in defaults, a JSON config file
//! selected by `VISIOND_CONFIG`, then per-field environment overrides.
//! Validation runs once after the layers are merged.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_ASSETS_DIR: &str = "assets";
const DEFAULT_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Deserialize, Default)]
struct VisiondConfigFile {
    source: Option<SourceConfigFile>,
    models: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    location: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    assets_dir: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    use_accelerator: Option<bool>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct VisiondConfig {
    pub source: SourceSettings,
    pub models: ModelSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub location: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Directory holding model artifacts and label files.
    pub assets_dir: PathBuf,
    pub confidence_threshold: f32,
    pub use_accelerator: bool,
}

impl VisiondConfig {
    /// Load from `VISIOND_CONFIG` (when set) plus environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISIOND_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit config file plus environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VisiondConfigFile) -> Self {
        let source = SourceSettings {
            location: file
                .source
                .as_ref()
                .and_then(|source| source.location.clone())
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            target_fps: file
                .source
                .as_ref()
                .and_then(|source| source.target_fps)
                .unwrap_or(DEFAULT_TARGET_FPS),
            width: file
                .source
                .as_ref()
                .and_then(|source| source.width)
                .unwrap_or(DEFAULT_WIDTH),
            height: file
                .source
                .as_ref()
                .and_then(|source| source.height)
                .unwrap_or(DEFAULT_HEIGHT),
        };
        let models = ModelSettings {
            assets_dir: file
                .models
                .as_ref()
                .and_then(|models| models.assets_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSETS_DIR)),
            confidence_threshold: file
                .models
                .as_ref()
                .and_then(|models| models.confidence_threshold)
                .unwrap_or(DEFAULT_CONFIDENCE),
            use_accelerator: file
                .models
                .and_then(|models| models.use_accelerator)
                .unwrap_or(false),
        };
        Self { source, models }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(location) = std::env::var("VISIOND_SOURCE") {
            if !location.trim().is_empty() {
                self.source.location = location;
            }
        }
        if let Ok(assets) = std::env::var("VISIOND_ASSETS_DIR") {
            if !assets.trim().is_empty() {
                self.models.assets_dir = PathBuf::from(assets);
            }
        }
        if let Ok(confidence) = std::env::var("VISIOND_CONFIDENCE") {
            let value: f32 = confidence
                .parse()
                .map_err(|_| anyhow!("VISIOND_CONFIDENCE must be a number in [0, 1]"))?;
            self.models.confidence_threshold = value;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.source.location.trim().is_empty() {
            return Err(anyhow!("source location must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.models.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                self.models.confidence_threshold
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<VisiondConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
