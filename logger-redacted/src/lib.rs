//! LGPD-aware logging for Portaria
//!
//! Every line emitted through `tracing` passes through a [`PiiRedactor`]
//! before it reaches stdout or the rotating log file. Operators' e-mails,
//! CPF numbers, phone numbers and IP addresses are replaced by a correlation
//! hash (or a mask when hashing is disabled).
//!
//! # Example
//!
//! ```rust,no_run
//! use logger_redacted::{init_tracing, LoggerConfig};
//!
//! let _guard = init_tracing(&LoggerConfig::default()).unwrap();
//! tracing::info!("Operator secretaria@escola.edu.br started a sync");
//! // Output: "Operator EMAIL[...] started a sync"
//! ```

pub mod config;
pub mod redactor;
pub mod writer;

pub use config::*;
pub use redactor::*;
pub use writer::*;

use std::sync::Arc;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Install the global tracing subscriber.
///
/// Returns the file writer guard when logging to a directory; keep it alive
/// for the lifetime of the process so buffered lines are flushed.
pub fn init_tracing(config: &LoggerConfig) -> Result<Option<WorkerGuard>, LoggerError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?;

    let redaction = if config.redaction_enabled {
        RedactionConfig {
            hash_for_correlation: config.hash_for_correlation,
            ..Default::default()
        }
    } else {
        RedactionConfig::disabled()
    };
    let redactor = Arc::new(PiiRedactor::new(redaction));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            install(filter, RedactingMakeWriter::new(non_blocking, redactor), config.json)?;
            Ok(Some(guard))
        }
        None => {
            install(filter, RedactingMakeWriter::new(std::io::stdout, redactor), config.json)?;
            Ok(None)
        }
    }
}

fn install<W>(filter: EnvFilter, writer: W, json: bool) -> Result<(), LoggerError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| LoggerError::Init(e.to_string()))
}
