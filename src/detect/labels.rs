//! Class-name label files.

use std::path::Path;

use anyhow::{anyhow, Result};

use crate::VisionError;

/// Load a newline-delimited label file.
///
/// One class name per line; blank lines are ignored; line order defines the
/// `class_id -> name` mapping. Fails with `MissingResource` when the file is
/// absent.
pub fn load_labels<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(VisionError::MissingResource(format!(
            "label file not found: {}",
            path.display()
        ))
        .into());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read label file {}: {}", path.display(), e))?;
    Ok(parse_labels(&raw))
}

fn parse_labels(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Synthesized labels for `stub://` models, where no file exists on disk.
pub(crate) fn synthetic_labels(class_count: usize) -> Vec<String> {
    (0..class_count).map(|id| format!("class_{}", id)).collect()
}
