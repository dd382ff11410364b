//! User configuration loaded from `config.toml`

use crate::utils::expand_tilde;
use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub perceptors: PerceptorsConfig,
}

/// How prompts interpret their weight and stop fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Reject zero weights and stops whose sign differs from the weight
    #[serde(default = "default_validate_stop_sign")]
    pub validate_stop_sign: bool,
    /// Which value a floored prompt reports
    #[serde(default)]
    pub floor_value: FloorValue,
}

fn default_validate_stop_sign() -> bool {
    true
}

/// Value reported once the signed distance drops below the stop.
///
/// The gradient is the same either way: zero while the floor is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FloorValue {
    /// Report the floor itself
    #[default]
    Floored,
    /// Report the raw signed distance
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// "cpu" or "cuda:N"
    pub name: String,
}

/// Settings for fetching image prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Request timeout; unset means wait indefinitely
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerceptorsConfig {
    /// Binary embedding tables used as offline text perceptors
    #[serde(default)]
    pub tables: Vec<PathBuf>,
    /// ONNX CLIP model (requires the `clip` feature)
    #[serde(default)]
    pub clip: Option<ClipModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipModelConfig {
    pub name: String,
    pub vision_model_url: String,
    pub text_model_url: String,
    pub tokenizer_url: String,
    /// Square input resolution of the vision model
    pub image_size: u32,
    /// Local model directory; defaults to the cache dir
    pub model_dir: Option<PathBuf>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            validate_stop_sign: true,
            floor_value: FloorValue::Floored,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "cpu".to_string(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("perceptor/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: None,
        }
    }
}

impl Default for ClipModelConfig {
    fn default() -> Self {
        Self {
            name: "clip-vit-base-patch32".to_string(),
            vision_model_url:
                "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/vision_model.onnx"
                    .to_string(),
            text_model_url:
                "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/text_model.onnx"
                    .to_string(),
            tokenizer_url:
                "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/tokenizer.json"
                    .to_string(),
            image_size: 224,
            model_dir: None,
        }
    }
}

impl DeviceConfig {
    /// Resolve the configured device, falling back to the CPU when CUDA is
    /// not available.
    pub fn device(&self) -> Result<Device> {
        let name = self.name.trim().to_lowercase();
        if name == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(ordinal) = name.strip_prefix("cuda") {
            let ordinal = match ordinal.strip_prefix(':') {
                Some(n) => n.parse::<usize>().context("Invalid CUDA ordinal")?,
                None if ordinal.is_empty() => 0,
                None => bail!("Unknown device '{}'", self.name),
            };
            let device = Device::cuda_if_available(ordinal)?;
            if device.is_cpu() {
                tracing::warn!(ordinal, "CUDA unavailable, using CPU");
            }
            return Ok(device);
        }
        bail!("Unknown device '{}'", self.name)
    }
}

impl PerceptorsConfig {
    /// Table paths with `~` expanded
    pub fn table_paths(&self) -> Vec<PathBuf> {
        self.tables
            .iter()
            .map(|p| expand_tilde(&p.to_string_lossy()))
            .collect()
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("com", "mrmattias", "perceptor")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load the user config, writing the defaults on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = toml::to_string_pretty(self)?;
        fs::write(path, data)?;

        Ok(())
    }
}
