//! A checkpoint is a directory holding `model.toml` (architecture, feature
//! statistics, channel schema) next to `params.safetensors` (weights).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use aline_core::time::now_rfc3339;
use aline_core::{FeatureSchema, FeatureStats, ModelConfig, ModelParams};
use candle_core::{Device, safetensors};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const MANIFEST_FILE: &str = "model.toml";
pub const WEIGHTS_FILE: &str = "params.safetensors";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub episodes: usize,
    pub best_epoch: usize,
    pub best_val_loss: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: String,
    pub model: ModelConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FeatureStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<FeatureSchema>,
}

impl Manifest {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: now_rfc3339(),
            model,
            training: None,
            stats: None,
            schema: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub manifest: Manifest,
    pub params: ModelParams,
}

impl Checkpoint {
    pub fn new(manifest: Manifest, params: ModelParams) -> Result<Self> {
        if manifest.model != *params.config() {
            return Err(StoreError::Manifest(
                "manifest architecture differs from the parameter bundle".into(),
            ));
        }
        if let Some(stats) = manifest
            .stats
            .as_ref()
            .filter(|s| !s.fits(manifest.model.n_features))
        {
            return Err(StoreError::Manifest(format!(
                "feature stats cover {} channels, model expects {}",
                stats.width(),
                manifest.model.n_features
            )));
        }
        Ok(Self { manifest, params })
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file() && dir.join(WEIGHTS_FILE).is_file()
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let manifest = toml::to_string_pretty(&self.manifest)
            .map_err(|e| StoreError::Manifest(e.to_string()))?;
        let tensors: HashMap<&str, _> = self
            .params
            .tensors()
            .iter()
            .map(|(name, t)| (name.as_str(), t.clone()))
            .collect();
        safetensors::save(&tensors, dir.join(WEIGHTS_FILE))?;
        fs::write(dir.join(MANIFEST_FILE), manifest)?;
        tracing::info!(
            "saved checkpoint to {} ({} parameters)",
            dir.display(),
            self.params.num_params()
        );
        Ok(())
    }

    /// Load and validate. Any missing or misshapen tensor is an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path).map_err(|e| {
            StoreError::Manifest(format!("failed to read {}: {e}", manifest_path.display()))
        })?;
        let manifest: Manifest =
            toml::from_str(&text).map_err(|e| StoreError::Manifest(e.to_string()))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::Manifest(format!(
                "unsupported format version {}",
                manifest.format_version
            )));
        }
        let tensors = safetensors::load(dir.join(WEIGHTS_FILE), &Device::Cpu)?;
        let params = ModelParams::from_tensors(manifest.model.clone(), tensors.into_iter().collect())?;
        tracing::debug!("loaded checkpoint from {}", dir.display());
        Self::new(manifest, params)
    }
}
