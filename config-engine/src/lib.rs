//! Layered configuration loading for Portaria
//!
//! Sources, lowest precedence first:
//! - **Defaults**: the `Default` impl of the typed config
//! - **Local Files**: YAML configuration file (optional or required)
//! - **Environment Variables**: `PORTARIA_` prefixed, `__` for nesting
//!
//! # Example
//!
//! ```rust,no_run
//! use config_engine::ConfigLoader;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct AppConfig {
//!     server_url: String,
//!     log_level: String,
//! }
//!
//! let config: AppConfig = ConfigLoader::new("PORTARIA_")
//!     .with_defaults(&AppConfig::default())
//!     .with_yaml_file("portaria.yaml")
//!     .load()
//!     .unwrap();
//! ```

pub mod error;
pub mod loader;

pub use error::*;
pub use loader::*;
