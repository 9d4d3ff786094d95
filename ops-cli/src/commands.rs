use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use colored::*;
use portaria_sync::domain::risk::{risk_list, RiskLevel};
use portaria_sync::{
    AuditAction, AuditFilter, Clock, ClockService, Collection, ConnectivityService, HttpRemote,
    SessionIdentity, SyncEngine, SyncFilter, SyncSummary,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine opened against the configured store and backend
pub struct Session {
    pub engine: SyncEngine,
    remote: Arc<HttpRemote>,
}

impl Session {
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let identity = Arc::new(match &config.operator.email {
            Some(email) => SessionIdentity::signed_in(email.clone(), config.operator.token.clone()),
            None => SessionIdentity::new(),
        });
        let clock = Arc::new(ClockService::system());
        let remote = Arc::new(
            HttpRemote::new(&config.sync, identity.clone())
                .context("Failed to build the HTTP client")?
                .with_clock(clock.clone()),
        );
        let connectivity = Arc::new(ConnectivityService::new(false));

        let engine = SyncEngine::new(config.engine(), remote.clone(), identity, clock, connectivity)
            .await
            .with_context(|| format!("Failed to open {}", config.database.db_path.display()))?;
        Ok(Self { engine, remote })
    }

    /// Probe the backend and publish the result to the engine
    pub async fn refresh_connectivity(&self) -> bool {
        let online = self.remote.probe().await;
        self.engine.connectivity().set_online(online);
        online
    }

    /// Give the background forwarder a chance to upload fresh records
    pub async fn flush(&self) {
        if !self.refresh_connectivity().await {
            println!("{}", "Offline: changes stay queued for the next sync".yellow());
            return;
        }
        if tokio::time::timeout(FLUSH_TIMEOUT, self.engine.forwarder().wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("Forwarder still busy, remaining records will go with the next sync");
        }
    }
}

pub fn parse_collections(names: &[String]) -> Result<Option<Vec<Collection>>> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|name| {
            Collection::from_name(name)
                .filter(|c| c.is_syncable())
                .with_context(|| format!("Unknown or non-syncable collection: {}", name))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub fn parse_action(name: &str) -> Result<AuditAction> {
    let code = name.trim().to_uppercase().replace('-', "_");
    serde_json::from_value(Value::String(code)).with_context(|| format!("Unknown audit action: {}", name))
}

pub async fn sync(session: &Session, filter: SyncFilter, json: bool) -> Result<()> {
    if !session.refresh_connectivity().await {
        bail!("Remote unreachable, nothing was synchronized");
    }
    let summary = session.engine.sync().sync_with(&filter).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    let failed = summary.failed_collections();
    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(|c| c.name()).collect();
        bail!("Synchronization incomplete for: {}", names.join(", "));
    }
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{} {}",
        "Synchronization".bright_cyan().bold(),
        summary.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(replay) = &summary.replay {
        println!(
            "  queued operations: {} sent, {} failed",
            replay.completed.to_string().green(),
            replay.failed.to_string().red()
        );
    }
    for report in &summary.collections {
        let name = format!("{:<22}", report.collection.name());
        if report.skipped {
            println!("  {} {}", name, "skipped (already running)".yellow());
            continue;
        }
        let pulled = report
            .pulled
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        let (pushed, failed) = report
            .pushed
            .as_ref()
            .map_or((0, 0), |p| (p.confirmed, p.failed.len()));
        let status = match &report.error {
            Some(error) => error.red().to_string(),
            None if failed > 0 => format!("{} not acknowledged", failed).yellow().to_string(),
            None => "ok".green().to_string(),
        };
        println!("  {} pulled {:>5}  pushed {:>5}  {}", name, pulled, pushed, status);
    }
}

/// Probe the backend periodically; every offline-to-online transition
/// triggers a full synchronization
pub async fn watch(session: &Session, interval: Duration) -> Result<()> {
    let _reconnect = session.engine.sync().on_reconnect();
    let mut ticker = tokio::time::interval(interval);
    println!(
        "{} every {}s, Ctrl+C to stop",
        "Watching connectivity".bright_cyan(),
        interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let online = session.refresh_connectivity().await;
                let debt = session.engine.sync().sync_debt().await?;
                tracing::info!(online, pending = debt.total(), "Connectivity check");
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "Stopped".bright_cyan());
                return Ok(());
            }
        }
    }
}

pub async fn pending(session: &Session) -> Result<()> {
    let debt = session.engine.sync().sync_debt().await?;
    if debt.is_empty() {
        println!("{}", "Everything is synchronized".green());
        return Ok(());
    }

    println!("{}", "Unsynchronized records".bright_cyan().bold());
    for (collection, count) in &debt.per_collection {
        println!("  {:<22} {}", collection, count.to_string().yellow());
    }

    let operations = session.engine.sync_queue().pending_operations().await?;
    if !operations.is_empty() {
        println!("{}", "Queued operations".bright_cyan().bold());
        for op in operations {
            let error = op.last_error.as_deref().unwrap_or("");
            println!(
                "  {} {:?} {}/{} attempts={} {}",
                op.created_at.format("%Y-%m-%d %H:%M"),
                op.kind,
                op.collection,
                op.target_id,
                op.attempts,
                error.red()
            );
        }
    }
    Ok(())
}

pub async fn audit_query(session: &Session, filter: AuditFilter, json: bool) -> Result<()> {
    let entries = session.engine.audit().query(&filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:>6} {} {:<28} {:<22} {}/{}",
            entry.seq,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.actor,
            entry.action.as_str().bright_white(),
            entry.target_type,
            entry.target_id
        );
    }
    println!("{} entries", entries.len());
    Ok(())
}

pub async fn audit_verify(session: &Session) -> Result<()> {
    let verification = session.engine.audit().verify_chain().await?;
    match verification.first_break {
        None => {
            println!("{} ({} entries)", "Audit chain intact".green(), verification.entries);
            Ok(())
        }
        Some(seq) => bail!("Audit chain broken at entry {}", seq),
    }
}

pub async fn audit_delete(session: &Session, entry_id: &str, log_deletion: bool) -> Result<()> {
    session
        .engine
        .delete_audit_entry(entry_id, log_deletion)
        .await
        .context("Audit entry not deleted")?;
    println!("{} {}", "Deleted audit entry".green(), entry_id);
    Ok(())
}

pub async fn risk(session: &Session, class_id: Option<&str>, json: bool) -> Result<()> {
    let engine = &session.engine;
    let students = engine.roster().students().await?;
    let classes = engine.roster().classes().await?;
    let records = engine.access().all_records().await?;

    let mut list = risk_list(
        &students,
        &classes,
        &records,
        engine.clock().now(),
        &engine.config().attendance,
    );
    if let Some(class_id) = class_id {
        list.retain(|entry| entry.class_id.as_deref() == Some(class_id));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    if list.is_empty() {
        println!("{}", "No students at risk".green());
        return Ok(());
    }
    for entry in &list {
        let level = match entry.assessment.level {
            RiskLevel::High => "HIGH".red().bold(),
            RiskLevel::Medium => "MEDIUM".yellow(),
            RiskLevel::Low => "LOW".normal(),
        };
        let factors: Vec<String> = entry.assessment.factors.iter().map(ToString::to_string).collect();
        println!(
            "{:<8} {:>2}  {:<10} {:<6} {:<30} {}",
            level,
            entry.assessment.score,
            entry.student_id,
            entry.class_id.as_deref().unwrap_or("-"),
            entry.name,
            factors.join("; ")
        );
    }
    Ok(())
}

pub async fn keys(session: &Session) -> Result<()> {
    let keys = session.engine.keys();
    let current = keys.current_key().await?.map(|k| k.version);
    for key in keys.keys().await? {
        let marker = if Some(key.version) == current { "*" } else { " " };
        let state = if key.active { "active".green() } else { "inactive".normal() };
        println!(
            "{} v{:<3} {:<8} created {} expires {}",
            marker,
            key.version,
            state,
            key.created_at.format("%Y-%m-%d"),
            key.expires_at.format("%Y-%m-%d")
        );
    }
    report_overlap(session).await
}

pub async fn rotate_key(session: &Session) -> Result<()> {
    let key = session.engine.keys().rotate_key(&session.engine.actor()).await?;
    println!(
        "{} version {} (expires {})",
        "Rotated signing key:".green(),
        key.version,
        key.expires_at.format("%Y-%m-%d")
    );
    report_overlap(session).await
}

pub async fn deactivate_key(session: &Session, version: u32) -> Result<()> {
    session
        .engine
        .keys()
        .deactivate_key(&session.engine.actor(), version)
        .await?;
    println!("{} version {}", "Deactivated signing key".green(), version);
    Ok(())
}

async fn report_overlap(session: &Session) -> Result<()> {
    let expired = session.engine.keys().keys_past_overlap().await?;
    if !expired.is_empty() {
        let versions: Vec<String> = expired.iter().map(|v| format!("v{}", v)).collect();
        println!(
            "{} {} (use deactivate-key)",
            "Past the overlap window:".yellow(),
            versions.join(", ")
        );
    }
    Ok(())
}

pub async fn anonymize(session: &Session, student_id: &str) -> Result<()> {
    let student = session
        .engine
        .privacy()
        .anonymize_student(&session.engine.actor(), student_id)
        .await
        .with_context(|| format!("Student {} not anonymized", student_id))?;
    println!("{} {} -> {}", "Anonymized".green(), student.id, student.name);
    Ok(())
}

pub async fn retention(session: &Session, apply: bool) -> Result<()> {
    let retention = session.engine.retention();
    if !apply {
        for (policy, due) in retention.preview().await? {
            println!(
                "{} {:?} after {} days: {} student(s)",
                policy.entity_type.bright_white(),
                policy.action,
                policy.period_days,
                due.len()
            );
            for student in due {
                println!("  {}", student.id);
            }
        }
        println!("{}", "Preview only; run with --apply to act".yellow());
        return Ok(());
    }

    let report = retention.apply(&session.engine.actor()).await?;
    println!(
        "{} anonymized {}, deleted {}, failed {}",
        "Retention applied:".green(),
        report.anonymized.len(),
        report.deleted.len(),
        report.failed.len()
    );
    for (student_id, error) in &report.failed {
        println!("  {} {}", student_id, error.red());
    }
    Ok(())
}
