use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning for space partitioning and view caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Radius of a space; neighbouring spaces are `2 * space_size` apart.
    pub space_size: f32,
    /// Multiplicative padding of each space's bounds, so volumes on a
    /// boundary land in both neighbours.
    pub space_fudge: f32,
    /// Radius of the sphere around a viewer whose spaces are watched.
    pub proximity_radius: f32,
    /// How long a viewer keeps a space it has left before its cells are
    /// unloaded. Zero unloads immediately.
    pub exit_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            space_size: 25.0,
            space_fudge: 1.01,
            proximity_radius: 10.0,
            exit_grace_ms: 0,
        }
    }
}

impl StreamConfig {
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    /// Squared distance a viewer has to move before its spaces are
    /// recomputed.
    pub fn revalidation_distance_squared(&self) -> f32 {
        let d = self.space_size / 4.0;
        d * d
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.space_size > 0.0 && self.space_size.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "space_size must be positive, got {}",
                self.space_size
            )));
        }
        if !(self.space_fudge >= 1.0 && self.space_fudge.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "space_fudge must be at least 1, got {}",
                self.space_fudge
            )));
        }
        if !(self.proximity_radius > 0.0 && self.proximity_radius.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "proximity_radius must be positive, got {}",
                self.proximity_radius
            )));
        }
        Ok(())
    }

    /// Parse and validate a YAML document. Missing fields take defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }
}
