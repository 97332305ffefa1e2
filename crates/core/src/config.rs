use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "RECOLOR_DATA_DIR";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
/// Written above the serialized values of a new `config.toml`.
pub const CONFIG_HEADER: &str = "\
# recolor configuration
#
# Model artifacts are read from paths.models_dir:
#   model.network         ONNX graph of the colorization network
#   model.weights         weight file the graph's external data points into
#   model.cluster_points  313x2 ab cluster centers (.npy), fetched by default
#
# No public download exists for the ONNX network and its weight file. Export
# the network to ONNX with its weights saved as external data in a single
# file, then either copy both files into models_dir or serve them from a
# mirror and add sources so `recolor fetch-models` and startup can fetch them:
#
#   [fetch.sources.network]
#   url = \"https://mirror.example/colorization_deploy_v2.onnx\"
#   sha256 = \"<hex digest>\"
#
#   [fetch.sources.weights]
#   url = \"https://mirror.example/colorization_release_v2.bin\"

";

pub const CLUSTER_POINTS_URL: &str =
    "https://raw.githubusercontent.com/richzhang/colorization/caffe/resources/pts_in_hull.npy";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

/// File names of the three model artifacts, relative to `paths.models_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub network: PathBuf,
    pub weights: PathBuf,
    pub cluster_points: PathBuf,
    pub backend: InferenceBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    pub auto_fetch: bool,
    pub sources: FetchSources,
}

/// Download locations per artifact. Only the cluster points have a public
/// default; see [`CONFIG_HEADER`] for the network and weight files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchSources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<ArtifactSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<ArtifactSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_points: Option<ArtifactSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSource {
    pub url: String,
    /// Lowercase hex digest checked before the download is moved into place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            network: PathBuf::from("colorization_deploy_v2.onnx"),
            weights: PathBuf::from("colorization_release_v2.bin"),
            cluster_points: PathBuf::from("pts_in_hull.npy"),
            backend: InferenceBackend::Cpu,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            auto_fetch: true,
            sources: FetchSources::default(),
        }
    }
}

impl Default for FetchSources {
    fn default() -> Self {
        Self {
            network: None,
            weights: None,
            cluster_points: Some(ArtifactSource {
                url: CLUSTER_POINTS_URL.to_string(),
                sha256: None,
            }),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, format!("{CONFIG_HEADER}{encoded}"))
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Load `config.toml` from the data dir, falling back to defaults when it
    /// is missing or unreadable.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let cfg_path = config_path(data_dir);
        match Self::load_from_path(&cfg_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
                Self::default()
            }
        }
    }
}

/// Resolve the data directory:
/// 1. CLI override if provided
/// 2. RECOLOR_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
