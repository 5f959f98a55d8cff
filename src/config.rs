//! Runtime configuration types.
//!
//! Settings come from an optional `c0vm.toml` file; command-line flags
//! override whatever the file sets.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file, looked up in the working directory.
pub const CONFIG_FILE: &str = "c0vm.toml";

/// Output format for execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Log every executed instruction
    pub trace: bool,
    /// Count executed instructions per opcode
    pub profile_opcodes: bool,
    /// Print execution statistics after the run
    pub stats: Option<StatsFormat>,
    /// Log filter directive, used when `C0VM_LOG` is unset
    pub log: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl RuntimeConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if given, else `c0vm.toml` from `dir` when it exists,
    /// else the defaults.
    pub fn discover(path: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = dir.join(CONFIG_FILE);
                if default.is_file() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}
