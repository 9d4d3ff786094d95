// CLI configuration
use config_engine::{ConfigError, ConfigLoader, Validate};
use logger_redacted::LoggerConfig;
use portaria_sync::config::{LocalDbConfig, PrivacyConfig, SyncConfig};
use portaria_sync::domain::attendance::AttendancePolicy;
use portaria_sync::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "PORTARIA_";

/// Operator the CLI acts as; becomes the audit actor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub email: Option<String>,
    /// Bearer token for the school API, usually set via `PORTARIA_OPERATOR__TOKEN`
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggerConfig,
    pub operator: OperatorConfig,
    pub database: LocalDbConfig,
    pub sync: SyncConfig,
    pub attendance: AttendancePolicy,
    pub privacy: PrivacyConfig,
}

impl AppConfig {
    /// Defaults, then the YAML file, then `PORTARIA_*` variables.
    /// The file is optional unless `required` is set.
    pub fn load(path: impl AsRef<Path>, required: bool) -> config_engine::Result<Self> {
        let loader = ConfigLoader::new(ENV_PREFIX).with_defaults(&Self::default());
        let loader = if required {
            loader.with_required_yaml_file(path)?
        } else {
            loader.with_yaml_file(path)
        };
        loader.load_validated()
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            database: self.database.clone(),
            sync: self.sync.clone(),
            attendance: self.attendance.clone(),
            privacy: self.privacy.clone(),
        }
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> config_engine::Result<()> {
        if let Some(email) = &self.operator.email {
            if !email.contains('@') {
                return Err(ConfigError::ValidationError(format!(
                    "operator.email '{}' is not an e-mail address",
                    email
                )));
            }
        }
        self.engine().validate().map_err(ConfigError::ValidationError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load("portaria.yaml", false).unwrap();
            assert_eq!(config.sync.batch_size, 100);
            assert!(config.operator.email.is_none());
            assert!(config.logging.redaction_enabled);
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "portaria.yaml",
                "operator:\n  email: secretaria@escola.br\nsync:\n  server_url: https://api.escola.br\nattendance:\n  tolerance_minutes: 10\n",
            )?;
            jail.set_env("PORTARIA_SYNC__BATCH_SIZE", "20");
            jail.set_env("PORTARIA_OPERATOR__TOKEN", "abc");

            let config = AppConfig::load("portaria.yaml", true).unwrap();
            assert_eq!(config.operator.email.as_deref(), Some("secretaria@escola.br"));
            assert_eq!(config.operator.token.as_deref(), Some("abc"));
            assert_eq!(config.sync.server_url, "https://api.escola.br");
            assert_eq!(config.sync.batch_size, 20);
            assert_eq!(config.engine().attendance.tolerance_minutes, 10);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("PORTARIA_SYNC__BATCH_SIZE", "0");
            assert!(matches!(
                AppConfig::load("portaria.yaml", false),
                Err(ConfigError::ValidationError(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_required_file_must_exist() {
        Jail::expect_with(|_jail| {
            assert!(matches!(
                AppConfig::load("missing.yaml", true),
                Err(ConfigError::SourceNotFound(_))
            ));
            Ok(())
        });
    }
}
