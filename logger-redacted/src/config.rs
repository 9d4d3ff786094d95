// Logger configuration
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub log_level: String,
    pub redaction_enabled: bool,
    /// Replace redacted values with a short hash so occurrences can be correlated
    pub hash_for_correlation: bool,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// When set, logs go to a daily rotated file in this directory instead of stdout
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            redaction_enabled: true,
            hash_for_correlation: true,
            json: false,
            log_dir: None,
            file_prefix: "portaria.log".to_string(),
        }
    }
}
