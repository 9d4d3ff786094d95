//! Sync markers and the pending-operation queue.
//!
//! Every syncable document carries `sincronizado`: 0 while a local change has
//! not been acknowledged by the remote, 1 once it has. Deletions cannot be
//! expressed as a flagged document, so they go through `operacoes_pendentes`.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::model::{check_document, OperationKind, PendingOperation, SyncFlag};
use crate::store::{document_key, Collection, LocalStore, TxMode, SYNC_FLAG_FIELD};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Read the flag of a raw document
pub fn flag_of(doc: &Value) -> SyncFlag {
    SyncFlag::from_json(doc.get(SYNC_FLAG_FIELD))
}

/// Set the flag on a raw document
pub fn set_flag(doc: &mut Value, flag: SyncFlag) {
    if let Some(object) = doc.as_object_mut() {
        object.insert(SYNC_FLAG_FIELD.to_string(), Value::from(flag.as_i64()));
    }
}

fn without_flag(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Some(object) = doc.as_object_mut() {
        object.remove(SYNC_FLAG_FIELD);
    }
    doc
}

/// Result of a pull-replace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullOutcome {
    /// Remote documents written as confirmed
    pub applied: usize,
    /// Local pending documents kept as they were
    pub preserved: usize,
    /// Remote documents skipped because a local delete is queued for them
    pub suppressed: usize,
    /// Remote documents that do not decode as the collection's record type
    pub rejected: usize,
}

/// Outstanding local changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncDebt {
    pub per_collection: BTreeMap<String, u64>,
    pub pending_operations: u64,
}

impl SyncDebt {
    pub fn total(&self) -> u64 {
        self.per_collection.values().sum::<u64>() + self.pending_operations
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Marker bookkeeping over the local store
#[derive(Clone)]
pub struct SyncQueue {
    store: LocalStore,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Add an operation to the pending queue
    pub async fn queue_operation(
        &self,
        kind: OperationKind,
        collection: Collection,
        target_id: &str,
        payload: Option<Value>,
    ) -> SyncResult<PendingOperation> {
        let operation = self.new_operation(kind, collection, target_id, payload);
        self.store.insert(&operation).await?;

        tracing::debug!(
            operation_id = %operation.id,
            collection = %collection,
            target_id,
            kind = ?kind,
            "Queued pending operation"
        );

        Ok(operation)
    }

    fn new_operation(
        &self,
        kind: OperationKind,
        collection: Collection,
        target_id: &str,
        payload: Option<Value>,
    ) -> PendingOperation {
        PendingOperation {
            id: Uuid::new_v4().to_string(),
            kind,
            collection,
            target_id: target_id.to_string(),
            payload,
            created_at: self.clock.now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Remove a document locally and queue its remote DELETE in one
    /// transaction, so a pull can never observe one without the other.
    /// Returns `false` if the document was not stored.
    pub async fn delete_and_queue(&self, collection: Collection, key: &str) -> SyncResult<bool> {
        let mut tx = self
            .store
            .transaction(&[collection, Collection::PendingOperations], TxMode::ReadWrite)
            .await?;

        if !tx.delete(collection, key).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        let operation = self.new_operation(OperationKind::Delete, collection, key, None);
        tx.insert(&operation).await?;
        tx.commit().await?;

        tracing::debug!(
            operation_id = %operation.id,
            collection = %collection,
            target_id = key,
            "Deleted locally and queued remote delete"
        );
        Ok(true)
    }

    /// Pending operations, oldest first
    pub async fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        let mut operations: Vec<PendingOperation> = self.store.load_all().await?;
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(operations)
    }

    /// Remove an operation the remote has confirmed
    pub async fn complete_operation(&self, operation_id: &str) -> SyncResult<()> {
        self.store
            .remove::<PendingOperation>(operation_id)
            .await?;
        tracing::debug!(operation_id, "Completed pending operation");
        Ok(())
    }

    /// Record a failed attempt; the operation stays queued
    pub async fn mark_failed(&self, operation_id: &str, error: &str) -> SyncResult<()> {
        let mut operation: PendingOperation = self
            .store
            .load(operation_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", operation_id)))?;
        operation.attempts += 1;
        operation.last_error = Some(error.to_string());
        self.store.save(&operation).await?;

        tracing::warn!(
            operation_id,
            attempts = operation.attempts,
            error,
            "Pending operation failed"
        );
        Ok(())
    }

    /// Documents of a collection still waiting for the remote
    pub async fn list_pending(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        self.store
            .get_all_by_index(collection, SYNC_FLAG_FIELD, SyncFlag::Pending)
            .await
    }

    pub async fn pending_count(&self, collection: Collection) -> SyncResult<u64> {
        self.store
            .count_by_index(collection, SYNC_FLAG_FIELD, SyncFlag::Pending)
            .await
    }

    pub async fn sync_debt(&self) -> SyncResult<SyncDebt> {
        let mut debt = SyncDebt::default();
        for collection in Collection::syncable() {
            let count = self.pending_count(collection).await?;
            if count > 0 {
                debt.per_collection.insert(collection.name().to_string(), count);
            }
        }
        debt.pending_operations = self.store.count(Collection::PendingOperations).await?;
        Ok(debt)
    }

    /// Mark documents confirmed, unconditionally, in one transaction
    pub async fn confirm_synced(&self, collection: Collection, keys: &[String]) -> SyncResult<usize> {
        let mut tx = self.store.transaction(&[collection], TxMode::ReadWrite).await?;
        let mut confirmed = 0;
        for key in keys {
            if let Some(mut doc) = tx.get(collection, key).await? {
                set_flag(&mut doc, SyncFlag::Confirmed);
                tx.put(collection, &doc).await?;
                confirmed += 1;
            }
        }
        tx.commit().await?;
        Ok(confirmed)
    }

    /// Mark documents confirmed only if the stored copy still equals what was
    /// sent. A document edited locally while the push was in flight keeps its
    /// pending flag. Returns the keys confirmed.
    pub async fn confirm_if_unchanged(
        &self,
        collection: Collection,
        sent: &[Value],
    ) -> SyncResult<Vec<String>> {
        let mut tx = self.store.transaction(&[collection], TxMode::ReadWrite).await?;
        let mut confirmed = Vec::with_capacity(sent.len());
        for doc in sent {
            let key = document_key(collection, doc)?;
            let Some(mut stored) = tx.get(collection, &key).await? else {
                continue;
            };
            if without_flag(&stored) != without_flag(doc) {
                tracing::debug!(collection = %collection, key = %key, "Document changed during push, left pending");
                continue;
            }
            set_flag(&mut stored, SyncFlag::Confirmed);
            tx.put(collection, &stored).await?;
            confirmed.push(key);
        }
        tx.commit().await?;
        Ok(confirmed)
    }

    /// Replace the confirmed contents of a collection with the remote
    /// snapshot while keeping every pending local document unchanged.
    pub async fn pull_replace(
        &self,
        collection: Collection,
        remote: Vec<Value>,
    ) -> SyncResult<PullOutcome> {
        let mut tx = self
            .store
            .transaction(&[collection, Collection::PendingOperations], TxMode::ReadWrite)
            .await?;

        let pending = tx
            .get_all_by_index(collection, SYNC_FLAG_FIELD, SyncFlag::Pending)
            .await?;

        let queued_deletes: HashSet<String> = tx
            .get_all_by_index(Collection::PendingOperations, "colecao", collection.name())
            .await?
            .into_iter()
            .filter_map(|value| serde_json::from_value::<PendingOperation>(value).ok())
            .filter(|operation| operation.kind == OperationKind::Delete)
            .map(|operation| operation.target_id)
            .collect();

        tx.clear(collection).await?;

        let mut outcome = PullOutcome::default();
        for mut doc in remote {
            let key = match document_key(collection, &doc) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Skipping remote document without key");
                    continue;
                }
            };
            if queued_deletes.contains(&key) {
                outcome.suppressed += 1;
                continue;
            }
            set_flag(&mut doc, SyncFlag::Confirmed);
            if let Err(e) = check_document(collection, &doc) {
                tracing::warn!(collection = %collection, key = %key, error = %e, "Skipping malformed remote document");
                outcome.rejected += 1;
                continue;
            }
            tx.put(collection, &doc).await?;
            outcome.applied += 1;
        }

        // Local pending edits win over the remote copy
        for doc in &pending {
            tx.put(collection, doc).await?;
        }
        outcome.preserved = pending.len();

        tx.commit().await?;

        tracing::info!(
            collection = %collection,
            applied = outcome.applied,
            preserved = outcome.preserved,
            suppressed = outcome.suppressed,
            rejected = outcome.rejected,
            "Pulled remote snapshot"
        );
        Ok(outcome)
    }
}
