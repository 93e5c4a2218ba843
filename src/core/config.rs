use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Optional on-disk settings. Everything here can also come from CLI flags
/// or environment variables; flags win over config, config wins over
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend ID to use for online inference (see `backends.toml`).
    pub backend: Option<String>,
    /// Model override for the selected backend.
    pub model: Option<String>,
    /// Base-URL override for the selected backend.
    pub base_url: Option<String>,
    /// Path to an already-provisioned local model file.
    pub model_path: Option<PathBuf>,
    /// URL to provision the local model from when no file is present.
    pub model_url: Option<String>,
    /// Output cap handed to the local engine (and to providers that
    /// require one).
    pub max_output_tokens: Option<u32>,
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        match Self::config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "permacommons", "tandem")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Where provisioned model files land by default.
    pub fn default_model_dir() -> PathBuf {
        ProjectDirs::from("org", "permacommons", "tandem")
            .map(|dirs| dirs.data_dir().join("models"))
            .unwrap_or_else(|| std::env::temp_dir().join("tandem-models"))
    }
}
