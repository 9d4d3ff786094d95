use crate::error::{ConfigError, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

/// Post-deserialisation checks for a configuration type
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Layers configuration sources in increasing precedence:
/// defaults → YAML files → environment variables.
pub struct ConfigLoader {
    figment: Figment,
    env_prefix: String,
}

impl ConfigLoader {
    /// `env_prefix` is stripped from variable names, `__` separates nesting
    /// levels: `PORTARIA_SYNC__BATCH_SIZE` sets `sync.batch_size`.
    pub fn new(env_prefix: impl Into<String>) -> Self {
        Self {
            figment: Figment::new(),
            env_prefix: env_prefix.into(),
        }
    }

    pub fn with_defaults<T: Serialize>(mut self, defaults: &T) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(defaults));
        self
    }

    /// Merge a YAML file; a missing file is skipped
    pub fn with_yaml_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Optional config file not found, skipping");
        }
        self.figment = self.figment.merge(Yaml::file(path));
        self
    }

    /// Merge a YAML file that must exist
    pub fn with_required_yaml_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::SourceNotFound(path.display().to_string()));
        }
        Ok(self.with_yaml_file(path))
    }

    pub fn load<T: DeserializeOwned>(self) -> Result<T> {
        let figment = self
            .figment
            .merge(Env::prefixed(&self.env_prefix).split("__"));
        Ok(figment.extract()?)
    }

    pub fn load_validated<T: DeserializeOwned + Validate>(self) -> Result<T> {
        let config: T = self.load()?;
        config.validate()?;
        Ok(config)
    }
}
