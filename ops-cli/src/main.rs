use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ops_cli::commands::{self, parse_action, parse_collections};
use ops_cli::{AppConfig, Session};
use portaria_sync::{AuditFilter, SyncFilter};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "portaria.yaml";

/// Portaria operator tool
#[derive(Parser, Debug)]
#[command(name = "portaria")]
#[command(about = "Synchronization, audit and LGPD operations for the school gate")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults to ./portaria.yaml when present)
    #[arg(short, long, env = "PORTARIA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay queued operations, then pull and push collections
    Sync {
        /// Restrict to these collections (repeatable)
        #[arg(long = "collection", value_name = "NAME")]
        collections: Vec<String>,

        #[arg(long, conflicts_with = "push_only")]
        pull_only: bool,

        #[arg(long)]
        push_only: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe the backend and synchronize on every reconnection
    Watch {
        /// Seconds between probes
        #[arg(long, default_value = "30")]
        interval: u64,
    },

    /// Show unsynchronized records and queued operations
    Pending,

    /// Audit trail operations
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },

    /// List students at dropout risk
    Risk {
        /// Only students of this class, e.g. 9-A
        #[arg(long)]
        class: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// List signing keys
    Keys,

    /// Generate the next signing key version
    RotateKey,

    /// Stop accepting signatures from a key version
    DeactivateKey { version: u32 },

    /// Replace a former student's personal data with a pseudonym
    Anonymize { student_id: String },

    /// Preview or apply the retention policies
    Retention {
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Query entries, newest first
    Query {
        #[arg(long)]
        actor: Option<String>,

        /// Action code, e.g. STUDENT_CREATE or key-rotate
        #[arg(long)]
        action: Option<String>,

        /// Collection of the affected record
        #[arg(long)]
        target_type: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Recompute the hash chain
    Verify,

    /// Delete one entry (super administrator only)
    Delete {
        id: String,

        /// Do not record the deletion itself
        #[arg(long)]
        no_log: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = AppConfig::load(&config_path, args.config.is_some())
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if args.verbose {
        config.logging.log_level = "debug".to_string();
    }

    let _guard = logger_redacted::init_tracing(&config.logging).context("Failed to initialize logging")?;
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    let session = Session::open(&config).await?;

    match args.command {
        Command::Sync {
            collections,
            pull_only,
            push_only,
            json,
        } => {
            let filter = SyncFilter {
                collections: parse_collections(&collections)?,
                pull: !push_only,
                push: !pull_only,
            };
            commands::sync(&session, filter, json).await?;
        }
        Command::Watch { interval } => {
            commands::watch(&session, Duration::from_secs(interval.max(1))).await?;
        }
        Command::Pending => commands::pending(&session).await?,
        Command::Audit { command } => match command {
            AuditCommand::Query {
                actor,
                action,
                target_type,
                limit,
                json,
            } => {
                let filter = AuditFilter {
                    actor,
                    action: action.as_deref().map(parse_action).transpose()?,
                    target_type,
                    limit: Some(limit),
                    ..AuditFilter::default()
                };
                commands::audit_query(&session, filter, json).await?;
            }
            AuditCommand::Verify => commands::audit_verify(&session).await?,
            AuditCommand::Delete { id, no_log } => {
                commands::audit_delete(&session, &id, !no_log).await?;
                session.flush().await;
            }
        },
        Command::Risk { class, json } => commands::risk(&session, class.as_deref(), json).await?,
        Command::Keys => commands::keys(&session).await?,
        Command::RotateKey => {
            commands::rotate_key(&session).await?;
            session.flush().await;
        }
        Command::DeactivateKey { version } => {
            commands::deactivate_key(&session, version).await?;
            session.flush().await;
        }
        Command::Anonymize { student_id } => {
            commands::anonymize(&session, &student_id).await?;
            session.flush().await;
        }
        Command::Retention { apply } => {
            commands::retention(&session, apply).await?;
            if apply {
                session.flush().await;
            }
        }
    }

    Ok(())
}
