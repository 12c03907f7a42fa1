// src/model_config.rs
use serde::Deserialize;
use std::path::Path;

/// Blob construction parameters for the HED network.
///
/// Values mirror the network's training setup: per-channel means in the
/// engine's native BGR order, a flat scale factor and no channel swap.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub mean: [f32; 3],
    pub scale_factor: f32,
    pub swap_rb: bool,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            mean: [105.0, 117.0, 123.0],
            scale_factor: 0.7,
            swap_rb: false,
        }
    }
}

impl PreprocessorConfig {
    pub const FILE_NAME: &'static str = "preprocessor_config.json";

    /// Reads `preprocessor_config.json` from `model_dir` if present, falling
    /// back to the defaults for the file or any missing field.
    pub fn load(model_dir: &Path) -> Result<Self, crate::hed_model::ModelError> {
        let path = model_dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }

        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}
