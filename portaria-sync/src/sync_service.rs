//! Pull/push synchronization between the local store and the remote API
//!
//! Protocol flow per collection:
//! 1. Pull: fetch the remote snapshot and pull-replace it locally, keeping
//!    pending documents
//! 2. Push: send pending documents and confirm the acknowledged ones
//!
//! Queued deletions are replayed before any collection is synchronized.
//! At most one run per collection is active at any time.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityService;
use crate::error::{SyncError, SyncResult};
use crate::markers::{set_flag, SyncDebt, SyncQueue};
use crate::model::{OperationKind, SyncFlag};
use crate::remote::RemoteApi;
use crate::store::{document_key, Collection};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Which collections and directions a run covers
#[derive(Debug, Clone)]
pub struct SyncFilter {
    /// None means every syncable collection
    pub collections: Option<Vec<Collection>>,
    pub pull: bool,
    pub push: bool,
}

impl Default for SyncFilter {
    fn default() -> Self {
        Self {
            collections: None,
            pull: true,
            push: true,
        }
    }
}

impl SyncFilter {
    pub fn only(collections: Vec<Collection>) -> Self {
        Self {
            collections: Some(collections),
            ..Self::default()
        }
    }

    fn selected(&self) -> Vec<Collection> {
        match &self.collections {
            Some(collections) => collections
                .iter()
                .copied()
                .filter(|c| c.is_syncable())
                .collect(),
            None => Collection::syncable().collect(),
        }
    }
}

/// Outcome of pushing one collection
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushReport {
    pub attempted: usize,
    pub confirmed: usize,
    /// Sent, but edited locally meanwhile; stays pending
    pub stale: usize,
    /// Keys the remote did not acknowledge
    pub failed: Vec<String>,
}

/// Outcome of replaying the pending-operation queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct CollectionReport {
    pub collection: Collection,
    /// Another run held the collection; nothing was done
    pub skipped: bool,
    pub pulled: Option<usize>,
    pub pushed: Option<PushReport>,
    pub error: Option<String>,
}

impl CollectionReport {
    fn new(collection: Collection) -> Self {
        Self {
            collection,
            skipped: false,
            pulled: None,
            pushed: None,
            error: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.pushed.as_ref().map_or(true, |p| p.failed.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub online: bool,
    pub replay: Option<ReplayReport>,
    pub collections: Vec<CollectionReport>,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.online
            && self.replay.as_ref().map_or(true, |r| r.failed == 0)
            && self.collections.iter().all(CollectionReport::is_clean)
    }

    pub fn failed_collections(&self) -> Vec<Collection> {
        self.collections
            .iter()
            .filter(|report| !report.is_clean())
            .map(|report| report.collection)
            .collect()
    }
}

/// Marks a collection busy for as long as it lives
struct InFlightGuard<'a> {
    running: &'a Mutex<HashSet<Collection>>,
    collection: Collection,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.collection);
    }
}

pub struct SyncService {
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityService>,
    config: SyncConfig,
    running: Mutex<HashSet<Collection>>,
    reconnect_registered: AtomicBool,
}

impl SyncService {
    pub fn new(
        queue: SyncQueue,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityService>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            config,
            running: Mutex::new(HashSet::new()),
            reconnect_registered: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self, collection: Collection) -> Option<InFlightGuard<'_>> {
        if self.running.lock().insert(collection) {
            Some(InFlightGuard {
                running: &self.running,
                collection,
            })
        } else {
            None
        }
    }

    fn acquire(&self, collection: Collection) -> SyncResult<InFlightGuard<'_>> {
        self.try_acquire(collection)
            .ok_or_else(|| SyncError::Busy(collection.name().to_string()))
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(SyncError::Network("offline".to_string()))
        }
    }

    pub fn is_running(&self, collection: Collection) -> bool {
        self.running.lock().contains(&collection)
    }

    pub async fn sync_debt(&self) -> SyncResult<SyncDebt> {
        self.queue.sync_debt().await
    }

    /// Pull-replace one collection from the remote snapshot
    pub async fn pull_collection(&self, collection: Collection) -> SyncResult<usize> {
        let _guard = self.acquire(collection)?;
        self.ensure_online()?;
        self.pull(collection).await
    }

    /// Push the pending documents of one collection
    pub async fn push_pending_records(&self, collection: Collection) -> SyncResult<PushReport> {
        let _guard = self.acquire(collection)?;
        self.ensure_online()?;
        self.push(collection).await
    }

    async fn pull(&self, collection: Collection) -> SyncResult<usize> {
        if !collection.pulls_from_remote() {
            return Err(SyncError::InvalidOperation(format!(
                "{} is not pulled from the remote",
                collection
            )));
        }
        let remote = self.remote.fetch_all(collection).await?;
        let outcome = self.queue.pull_replace(collection, remote).await?;
        Ok(outcome.applied)
    }

    async fn push(&self, collection: Collection) -> SyncResult<PushReport> {
        let pending = self.queue.list_pending(collection).await?;
        let mut report = PushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        for chunk in pending.chunks(self.config.batch_size.max(1)) {
            report.attempted += chunk.len();
            let outgoing: Vec<Value> = chunk
                .iter()
                .map(|doc| {
                    let mut doc = doc.clone();
                    set_flag(&mut doc, SyncFlag::Confirmed);
                    doc
                })
                .collect();

            let acknowledged = if collection.uses_batch_push() {
                self.push_batch(collection, chunk, &outgoing).await?
            } else {
                self.push_each(collection, chunk, &outgoing).await
            };

            let confirmed = self
                .queue
                .confirm_if_unchanged(collection, &acknowledged)
                .await?;
            report.confirmed += confirmed.len();
            report.stale += acknowledged.len() - confirmed.len();

            let acknowledged_keys: HashSet<String> = acknowledged
                .iter()
                .filter_map(|doc| document_key(collection, doc).ok())
                .collect();
            report.failed.extend(
                chunk
                    .iter()
                    .filter_map(|doc| document_key(collection, doc).ok())
                    .filter(|key| !acknowledged_keys.contains(key)),
            );
        }

        tracing::info!(
            collection = %collection,
            attempted = report.attempted,
            confirmed = report.confirmed,
            failed = report.failed.len(),
            "Pushed pending records"
        );
        Ok(report)
    }

    /// One request for the whole chunk; returns the locally stored copies the
    /// remote acknowledged
    async fn push_batch(
        &self,
        collection: Collection,
        chunk: &[Value],
        outgoing: &[Value],
    ) -> SyncResult<Vec<Value>> {
        let acks = self.remote.upsert_batch(collection, outgoing).await?;
        let confirmed: HashSet<String> = acks
            .into_iter()
            .filter(|ack| ack.status.is_confirmed())
            .map(|ack| ack.id)
            .collect();

        Ok(chunk
            .iter()
            .filter(|doc| {
                document_key(collection, doc)
                    .map(|key| confirmed.contains(&key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    /// One request per document; a failure affects only that document
    async fn push_each(&self, collection: Collection, chunk: &[Value], outgoing: &[Value]) -> Vec<Value> {
        let mut acknowledged = Vec::with_capacity(chunk.len());
        for (local, remote_copy) in chunk.iter().zip(outgoing) {
            match self.remote.upsert(collection, remote_copy).await {
                Ok(_) => acknowledged.push(local.clone()),
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Record push failed, left pending");
                }
            }
        }
        acknowledged
    }

    /// Send queued operations (deletions first of all) to the remote, oldest
    /// first
    pub async fn replay_pending_operations(&self) -> SyncResult<ReplayReport> {
        let _guard = self.acquire(Collection::PendingOperations)?;
        self.ensure_online()?;

        let mut report = ReplayReport::default();
        for operation in self.queue.pending_operations().await? {
            let result = match (operation.kind, &operation.payload) {
                (OperationKind::Delete, _) => {
                    self.remote.delete(operation.collection, &operation.target_id).await
                }
                (_, Some(payload)) => self
                    .remote
                    .upsert(operation.collection, payload)
                    .await
                    .map(|_| ()),
                (_, None) => Err(SyncError::InvalidOperation(format!(
                    "{:?} operation {} has no payload",
                    operation.kind, operation.id
                ))),
            };

            match result {
                Ok(()) => {
                    self.queue.complete_operation(&operation.id).await?;
                    report.completed += 1;
                }
                Err(e) => {
                    self.queue.mark_failed(&operation.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Pull then push one collection. Returns a skipped report if another
    /// run already holds it.
    pub async fn sync_collection(&self, collection: Collection, filter: &SyncFilter) -> CollectionReport {
        let mut report = CollectionReport::new(collection);
        let Some(_guard) = self.try_acquire(collection) else {
            tracing::debug!(collection = %collection, "Sync already running, skipping");
            report.skipped = true;
            return report;
        };

        if let Err(e) = self.ensure_online() {
            report.error = Some(e.to_string());
            return report;
        }

        if filter.pull && collection.pulls_from_remote() {
            match self.pull(collection).await {
                Ok(applied) => report.pulled = Some(applied),
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Pull failed");
                    report.error = Some(e.to_string());
                }
            }
        }

        if filter.push {
            match self.push(collection).await {
                Ok(pushed) => report.pushed = Some(pushed),
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Push failed");
                    report.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        report
    }

    pub async fn sync_all(&self) -> SyncSummary {
        self.sync_with(&SyncFilter::default()).await
    }

    /// Replay queued operations, then synchronize the selected collections
    /// concurrently
    pub async fn sync_with(&self, filter: &SyncFilter) -> SyncSummary {
        let started_at = Utc::now();
        let online = self.connectivity.is_online();
        if !online {
            tracing::info!("Offline, synchronization deferred");
            return SyncSummary {
                started_at,
                finished_at: Utc::now(),
                online,
                replay: None,
                collections: Vec::new(),
            };
        }

        let replay = if filter.push {
            match self.replay_pending_operations().await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(error = %e, "Replay of pending operations failed");
                    None
                }
            }
        } else {
            None
        };

        let selected = filter.selected();
        let collections =
            futures::future::join_all(selected.iter().map(|c| self.sync_collection(*c, filter))).await;

        let summary = SyncSummary {
            started_at,
            finished_at: Utc::now(),
            online,
            replay,
            collections,
        };
        tracing::info!(
            collections = summary.collections.len(),
            clean = summary.is_clean(),
            "Synchronization finished"
        );
        summary
    }

    /// Run `sync_all` on every offline-to-online transition. Only the first
    /// registration takes effect.
    pub fn on_reconnect(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.reconnect_registered.swap(true, Ordering::SeqCst) {
            return None;
        }

        let service = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        Some(tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    tracing::info!("Connectivity restored, starting synchronization");
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        service.sync_all().await;
                    });
                }
                was_online = online;
            }
        }))
    }
}
