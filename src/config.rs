//! EMO objective configuration.

use crate::error::{Error, Result};
use crate::nn::loss::{EmoVariant, IGNORE_INDEX};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Loss configuration for EMO fine-tuning.
///
/// ```yaml
/// variant: capped_ratio
/// ignore_index: -100
/// ratio_cap: 3.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmoConfig {
    /// Which MLE/EMO composition to train with
    #[serde(default)]
    pub variant: EmoVariant,

    /// Label value excluded from the loss
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,

    /// Upper bound on the detached MLE/EMO ratio (capped variant only)
    #[serde(default = "default_ratio_cap")]
    pub ratio_cap: f64,
}

fn default_ignore_index() -> i64 {
    IGNORE_INDEX
}

fn default_ratio_cap() -> f64 {
    3.0
}

impl Default for EmoConfig {
    fn default() -> Self {
        Self {
            variant: EmoVariant::default(),
            ignore_index: default_ignore_index(),
            ratio_cap: default_ratio_cap(),
        }
    }
}

impl EmoConfig {
    /// Set the MLE/EMO composition
    pub fn with_variant(mut self, variant: EmoVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Set the label value excluded from the loss
    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// Set the cap on the capped-ratio weight
    pub fn with_ratio_cap(mut self, cap: f64) -> Self {
        self.ratio_cap = cap;
        self
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.ignore_index >= 0 {
            return Err(Error::ConfigError {
                reason: format!(
                    "ignore_index must be negative so it never collides with a token id, got {}",
                    self.ignore_index
                ),
            });
        }
        if !self.ratio_cap.is_finite() || self.ratio_cap <= 0.0 {
            return Err(Error::ConfigError {
                reason: format!("ratio_cap must be finite and > 0, got {}", self.ratio_cap),
            });
        }
        Ok(())
    }

    /// Load and validate a YAML config file
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::ConfigError {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}
