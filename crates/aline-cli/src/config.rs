//! Service configuration: a TOML file whose values may reference the
//! environment as `${VAR}` or `${VAR:default}`. Every field has a default,
//! so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use aline_core::{InferenceConfig, PriorConfig, TrainConfig};
use anyhow::{Context, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").unwrap());

pub const DATA_DIR_ENV: &str = "ALINE_DATA_DIR";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    pub training: TrainingConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides `ALINE_DATA_DIR` and `~/.aline`.
    pub data_dir: Option<PathBuf>,
    /// Checkpoint directory; `<data_dir>/checkpoint` when unset.
    pub checkpoint: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Synthetic episodes drawn from the latent prior for warm-up.
    pub synthetic_episodes: usize,
    pub validation_fraction: f64,
    pub prior: PriorConfig,
    pub trainer: TrainConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            synthetic_episodes: 512,
            validation_fraction: 0.2,
            prior: PriorConfig::default(),
            trainer: TrainConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(&expand_env(raw, |k| std::env::var(k).ok()))?;
        config
            .inference
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if !(0.0..1.0).contains(&config.training.validation_fraction) {
            anyhow::bail!(
                "training.validation_fraction must be in [0, 1), got {}",
                config.training.validation_fraction
            );
        }
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .or_else(|| std::env::var(DATA_DIR_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.storage
            .checkpoint
            .clone()
            .unwrap_or_else(|| self.data_dir().join("checkpoint"))
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.data_dir().join("corpus.db")
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".aline")
}

/// Substitute `${VAR}` / `${VAR:default}`. Unset variables without a default
/// become empty strings.
pub fn expand_env(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(raw, |caps: &Captures| {
            lookup(&caps[1])
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}
