//! Audit registrar
//!
//! Features:
//! - Append-only entries stored locally before anything else happens
//! - Cryptographic hash chain for tamper detection
//! - Asynchronous upload through the background forwarder
//! - Filtered queries, newest first

use crate::error::{SyncError, SyncResult};
use crate::forwarder::BackgroundForwarder;
use crate::identity::IdentityProvider;
use crate::markers::SyncQueue;
use crate::model::{AuditAction, AuditLogEntry, SyncFlag, GENESIS_HASH};
use crate::store::Collection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub target_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor.as_ref().map_or(true, |actor| &entry.actor == actor)
            && self.action.map_or(true, |action| entry.action == action)
            && self
                .target_type
                .as_ref()
                .map_or(true, |target| &entry.target_type == target)
            && self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
    }
}

/// Result of walking the hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub entries: usize,
    /// Sequence number of the first entry that does not verify
    pub first_break: Option<u64>,
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        self.first_break.is_none()
    }
}

struct ChainHead {
    last_hash: String,
    next_seq: u64,
}

pub struct AuditRegistrar {
    queue: SyncQueue,
    forwarder: Option<Arc<BackgroundForwarder>>,
    head: Mutex<Option<ChainHead>>,
}

impl AuditRegistrar {
    pub fn new(queue: SyncQueue, forwarder: Option<Arc<BackgroundForwarder>>) -> Self {
        Self {
            queue,
            forwarder,
            head: Mutex::new(None),
        }
    }

    async fn load_head(&self) -> SyncResult<ChainHead> {
        let entries: Vec<AuditLogEntry> = self.queue.store().load_all().await?;
        Ok(match entries.iter().max_by_key(|entry| entry.seq) {
            Some(last) => ChainHead {
                last_hash: last.hash.clone(),
                next_seq: last.seq + 1,
            },
            None => ChainHead {
                last_hash: GENESIS_HASH.to_string(),
                next_seq: 0,
            },
        })
    }

    /// Append an entry. The local write must succeed; the upload is best
    /// effort and never delays the caller.
    pub async fn record(
        &self,
        actor: &str,
        action: AuditAction,
        target_type: &str,
        target_id: &str,
        before: Option<Value>,
        after: Option<Value>,
    ) -> SyncResult<AuditLogEntry> {
        let mut head = self.head.lock().await;
        if head.is_none() {
            let loaded = self
                .load_head()
                .await
                .map_err(|e| SyncError::AuditWriteFailure(e.to_string()))?;
            *head = Some(loaded);
        }
        let Some(chain) = head.as_mut() else {
            return Err(SyncError::AuditWriteFailure("audit chain unavailable".to_string()));
        };

        let mut entry = AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            seq: chain.next_seq,
            timestamp: self.queue.clock().now(),
            actor: actor.to_string(),
            action,
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            before,
            after,
            previous_hash: chain.last_hash.clone(),
            hash: String::new(),
            sync: SyncFlag::Pending,
        };
        entry.hash = entry.compute_hash();

        self.queue
            .store()
            .insert(&entry)
            .await
            .map_err(|e| SyncError::AuditWriteFailure(e.to_string()))?;

        chain.last_hash = entry.hash.clone();
        chain.next_seq += 1;
        drop(head);

        tracing::info!(
            audit_id = %entry.id,
            seq = entry.seq,
            actor = %entry.actor,
            action = %entry.action,
            target_type = %entry.target_type,
            "Audit entry recorded"
        );

        if let Some(forwarder) = &self.forwarder {
            forwarder.enqueue(Collection::AuditLog, entry.id.clone());
        }

        Ok(entry)
    }

    /// Entries matching the filter, newest first
    pub async fn query(&self, filter: &AuditFilter) -> SyncResult<Vec<AuditLogEntry>> {
        let store = self.queue.store();
        let candidates: Vec<AuditLogEntry> = if let Some(actor) = &filter.actor {
            store.load_by_index("ator", actor.as_str()).await?
        } else if let Some(action) = filter.action {
            store.load_by_index("acao", action.as_str()).await?
        } else {
            store.load_all().await?
        };

        let mut entries: Vec<AuditLogEntry> = candidates
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.seq.cmp(&a.seq)));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Walk the chain in sequence order and recompute every hash. A gap left
    /// by a logged deletion is bridged through the `AUDIT_DELETE` entry that
    /// recorded the removed entry's hashes.
    pub async fn verify_chain(&self) -> SyncResult<ChainVerification> {
        let mut entries: Vec<AuditLogEntry> = self.queue.store().load_all().await?;
        entries.sort_by_key(|entry| entry.seq);

        let bridges: HashMap<String, String> = entries
            .iter()
            .filter(|entry| entry.action == AuditAction::AuditDelete && entry.verify_hash())
            .filter_map(|entry| {
                let removed = entry.before.as_ref()?;
                let hash = removed.get("hash")?.as_str()?;
                let previous = removed.get("hash_anterior")?.as_str()?;
                Some((hash.to_string(), previous.to_string()))
            })
            .collect();

        let mut expected_previous = GENESIS_HASH.to_string();
        for entry in &entries {
            if !links_to(&entry.previous_hash, &expected_previous, &bridges) || !entry.verify_hash() {
                tracing::warn!(seq = entry.seq, audit_id = %entry.id, "Audit chain broken");
                return Ok(ChainVerification {
                    entries: entries.len(),
                    first_break: Some(entry.seq),
                });
            }
            expected_previous = entry.hash.clone();
        }

        Ok(ChainVerification {
            entries: entries.len(),
            first_break: None,
        })
    }

    /// Remove an entry locally and queue its remote deletion. Callers must
    /// check authorization with [`ensure_super_admin`] first.
    pub async fn delete_entry(
        &self,
        actor: &str,
        entry_id: &str,
        log_deletion: bool,
    ) -> SyncResult<()> {
        let entry: AuditLogEntry = self
            .queue
            .store()
            .load(entry_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("audit entry {}", entry_id)))?;

        {
            let mut head = self.head.lock().await;
            if head.is_none() {
                *head = Some(self.load_head().await?);
            }
            if !self.queue.delete_and_queue(Collection::AuditLog, entry_id).await? {
                return Err(SyncError::NotFound(format!("audit entry {}", entry_id)));
            }
            // the next entry links to the removed head's predecessor
            if let Some(chain) = head.as_mut() {
                if chain.last_hash == entry.hash {
                    chain.last_hash = entry.previous_hash.clone();
                }
            }
        }

        tracing::warn!(audit_id = entry_id, actor, "Audit entry deleted");

        if log_deletion {
            let summary = json!({
                "seq": entry.seq,
                "acao": entry.action,
                "entidade_tipo": entry.target_type,
                "entidade_id": entry.target_id,
                "hash": entry.hash,
                "hash_anterior": entry.previous_hash,
            });
            self.record(
                actor,
                AuditAction::AuditDelete,
                Collection::AuditLog.name(),
                entry_id,
                Some(summary),
                None,
            )
            .await?;
        }
        Ok(())
    }
}

/// Whether `previous` reaches `expected`, following recorded deletions
fn links_to(previous: &str, expected: &str, bridges: &HashMap<String, String>) -> bool {
    let mut current = previous;
    for _ in 0..=bridges.len() {
        if current == expected {
            return true;
        }
        match bridges.get(current) {
            Some(predecessor) => current = predecessor,
            None => return false,
        }
    }
    false
}

/// Only the configured super administrator may delete audit entries
pub fn ensure_super_admin(
    identity: &dyn IdentityProvider,
    super_admin: Option<&str>,
) -> SyncResult<String> {
    let current = identity
        .current_identity()
        .ok_or_else(|| SyncError::InvalidOperation("no identity signed in".to_string()))?;
    match super_admin {
        Some(admin) if admin.eq_ignore_ascii_case(&current.email) => Ok(current.email),
        _ => Err(SyncError::InvalidOperation(format!(
            "{} is not authorized to delete audit entries",
            current.email
        ))),
    }
}
