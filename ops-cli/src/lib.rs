//! Operator CLI for Portaria
//!
//! Runs against the same local store as the gate application and provides:
//! - Manual and continuous synchronization with the school API
//! - Inspection of unsynchronized records and queued operations
//! - Audit trail queries, chain verification and super-admin deletion
//! - Dropout-risk listing
//! - Signing-key rotation and LGPD anonymization / retention runs
//!
//! # Example Usage
//!
//! ```bash
//! portaria sync --collection alunos --pull-only
//! portaria watch --interval 30
//! portaria audit query --actor secretaria@escola.br --limit 20
//! portaria audit verify
//! portaria risk --class 9-A
//! portaria rotate-key
//! portaria retention --apply
//! ```

pub mod commands;
pub mod config;

pub use commands::Session;
pub use config::{AppConfig, OperatorConfig};
