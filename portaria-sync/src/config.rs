//! Configuration for the store, the synchronization engine and the domain
//! services. All sections deserialize with defaults so a partial YAML file or
//! a handful of environment variables is enough.

use crate::domain::attendance::AttendancePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the local database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalDbConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Maximum number of pooled connections. One keeps writers serialized.
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Overwrite freed pages on delete
    pub enable_secure_delete: bool,
    /// How long a statement waits on a locked database
    pub busy_timeout_ms: u64,
}

impl Default for LocalDbConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("portaria_local.db"),
            max_connections: 1,
            enable_wal: true,
            enable_secure_delete: true,
            busy_timeout_ms: 5_000,
        }
    }
}

impl LocalDbConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.db_path.as_os_str().is_empty() {
            return Err("database.db_path must not be empty".to_string());
        }
        if self.max_connections == 0 {
            return Err("database.max_connections must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Background forwarder tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Bounded job queue; enqueues beyond it leave the record pending
    pub queue_capacity: usize,
    /// Upload attempts per record before giving up until the next sync
    pub max_attempts: u32,
    /// Base delay between attempts, doubled on each retry
    pub backoff_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl ForwarderConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Remote API and synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote API; collections live under `<server_url>/<name>`
    pub server_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum records per push request
    pub batch_size: usize,
    pub forwarder: ForwarderConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/api".to_string(),
            timeout_secs: 30,
            batch_size: 100,
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(format!(
                "sync.server_url must be an http(s) URL, got '{}'",
                self.server_url
            ));
        }
        if self.timeout_secs == 0 {
            return Err("sync.timeout_secs must be greater than zero".to_string());
        }
        if self.batch_size == 0 {
            return Err("sync.batch_size must be greater than zero".to_string());
        }
        if self.forwarder.queue_capacity == 0 || self.forwarder.max_attempts == 0 {
            return Err("sync.forwarder queue_capacity and max_attempts must be positive".to_string());
        }
        Ok(())
    }
}

/// LGPD and key-management settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Identity allowed to delete audit entries
    pub super_admin: Option<String>,
    /// Validity of a freshly rotated signing key
    pub key_validity_days: i64,
    /// How long a superseded key stays active before it is reported
    pub key_overlap_days: i64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            super_admin: None,
            key_validity_days: 30,
            key_overlap_days: 7,
        }
    }
}

impl PrivacyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.key_validity_days <= 0 {
            return Err("privacy.key_validity_days must be positive".to_string());
        }
        if self.key_overlap_days < 0 || self.key_overlap_days > self.key_validity_days {
            return Err("privacy.key_overlap_days must be between 0 and key_validity_days".to_string());
        }
        Ok(())
    }
}

/// Everything the engine needs to start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: LocalDbConfig,
    pub sync: SyncConfig,
    pub attendance: AttendancePolicy,
    pub privacy: PrivacyConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.database.validate()?;
        self.sync.validate()?;
        self.attendance.validate()?;
        self.privacy.validate()
    }
}
