//! Dispatcher configuration: the key priority table and the recursion limit.

use crate::error::ConfigError;
use crate::key::{BackendKey, DEFAULT_KEY_ORDER, KeyOrder};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Loaded from TOML:
///
/// ```toml
/// max_depth = 32
/// key_order = ["Meta", "CUDA", "CPU", "Python", "Negative", "ZeroTensor",
///              "AutogradMeta", "AutogradCUDA", "AutogradCPU"]
/// ```
///
/// Missing fields take the built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Every key once, lowest priority first.
    pub key_order: Vec<BackendKey>,
    /// Maximum nesting depth of re-entrant resolution.
    pub max_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            key_order: DEFAULT_KEY_ORDER.to_vec(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl DispatchConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidDepth);
        }
        self.key_order().map(|_| ())
    }

    pub fn key_order(&self) -> Result<KeyOrder, ConfigError> {
        KeyOrder::from_ascending(&self.key_order)
    }
}
