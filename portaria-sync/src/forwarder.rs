//! Background forwarder: uploads freshly written records as soon as possible
//! without making the caller wait.
//!
//! Jobs go through a bounded channel to a single worker. A record that cannot
//! be delivered simply stays pending and is picked up by the next sync.

use crate::config::ForwarderConfig;
use crate::connectivity::ConnectivityService;
use crate::markers::{flag_of, set_flag, SyncQueue};
use crate::model::SyncFlag;
use crate::remote::RemoteApi;
use crate::store::Collection;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Counters exposed to callers and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStatus {
    pub queued: u64,
    pub delivered: u64,
    /// Gave up after all attempts; the record is still pending locally
    pub abandoned: u64,
    /// Nothing to do: offline, already confirmed or deleted
    pub skipped: u64,
    /// Rejected because the queue was full or the worker stopped
    pub dropped: u64,
    pub in_flight: usize,
}

#[derive(Debug)]
struct ForwardJob {
    collection: Collection,
    key: String,
}

enum Delivery {
    Delivered,
    Abandoned,
    Skipped,
}

pub struct BackgroundForwarder {
    sender: mpsc::Sender<ForwardJob>,
    status: Arc<watch::Sender<ForwarderStatus>>,
    worker: JoinHandle<()>,
}

impl BackgroundForwarder {
    /// Start the worker on the current runtime
    pub fn spawn(
        queue: SyncQueue,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityService>,
        config: ForwarderConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (status, _) = watch::channel(ForwarderStatus::default());
        let status = Arc::new(status);

        let worker = tokio::spawn(run_worker(
            receiver,
            queue,
            remote,
            connectivity,
            config,
            status.clone(),
        ));

        Self {
            sender,
            status,
            worker,
        }
    }

    /// Schedule a record for upload. Returns false if it could not be
    /// queued; the record then waits for the next sync.
    pub fn enqueue(&self, collection: Collection, key: impl Into<String>) -> bool {
        self.status.send_modify(|status| {
            status.queued += 1;
            status.in_flight += 1;
        });

        let job = ForwardJob {
            collection,
            key: key.into(),
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Forwarder queue rejected job");
                self.status.send_modify(|status| {
                    status.in_flight -= 1;
                    status.dropped += 1;
                });
                false
            }
        }
    }

    pub fn status(&self) -> ForwarderStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ForwarderStatus> {
        self.status.subscribe()
    }

    /// Wait until every queued job has been handled
    pub async fn wait_idle(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| status.in_flight == 0).await;
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}

impl Drop for BackgroundForwarder {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<ForwardJob>,
    queue: SyncQueue,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityService>,
    config: ForwarderConfig,
    status: Arc<watch::Sender<ForwarderStatus>>,
) {
    while let Some(job) = receiver.recv().await {
        let outcome = deliver(&job, &queue, remote.as_ref(), &connectivity, &config).await;
        status.send_modify(|status| {
            status.in_flight = status.in_flight.saturating_sub(1);
            match outcome {
                Delivery::Delivered => status.delivered += 1,
                Delivery::Abandoned => status.abandoned += 1,
                Delivery::Skipped => status.skipped += 1,
            }
        });
    }
    tracing::debug!("Forwarder worker stopped");
}

async fn deliver(
    job: &ForwardJob,
    queue: &SyncQueue,
    remote: &dyn RemoteApi,
    connectivity: &ConnectivityService,
    config: &ForwarderConfig,
) -> Delivery {
    for attempt in 1..=config.max_attempts {
        if !connectivity.is_online() {
            tracing::debug!(collection = %job.collection, key = %job.key, "Offline, leaving record pending");
            return Delivery::Skipped;
        }

        let doc = match queue.store().get(job.collection, &job.key).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Delivery::Skipped,
            Err(e) => {
                tracing::warn!(collection = %job.collection, key = %job.key, error = %e, "Forwarder could not read record");
                return Delivery::Abandoned;
            }
        };
        if flag_of(&doc) == SyncFlag::Confirmed {
            return Delivery::Skipped;
        }

        let mut outgoing = doc.clone();
        set_flag(&mut outgoing, SyncFlag::Confirmed);

        match remote.upsert(job.collection, &outgoing).await {
            Ok(_) => {
                return match queue.confirm_if_unchanged(job.collection, &[doc]).await {
                    Ok(_) => {
                        tracing::debug!(collection = %job.collection, key = %job.key, "Forwarded record");
                        Delivery::Delivered
                    }
                    Err(e) => {
                        tracing::warn!(collection = %job.collection, key = %job.key, error = %e, "Delivered but could not confirm locally");
                        Delivery::Abandoned
                    }
                };
            }
            Err(e) => {
                tracing::warn!(
                    collection = %job.collection,
                    key = %job.key,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "Forward attempt failed"
                );
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
            }
        }
    }
    Delivery::Abandoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LocalDbConfig;
    use crate::model::{AccessRecord, Movement};
    use crate::remote::MemoryRemote;
    use crate::store::LocalStore;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (SyncQueue, Arc<MemoryRemote>, Arc<ConnectivityService>) {
        let config = LocalDbConfig {
            db_path: dir.path().join("forwarder.db"),
            ..LocalDbConfig::default()
        };
        let store = LocalStore::open(&config).await.unwrap();
        (
            SyncQueue::new(store, Arc::new(SystemClock)),
            Arc::new(MemoryRemote::new()),
            Arc::new(ConnectivityService::new(true)),
        )
    }

    fn fast() -> ForwarderConfig {
        ForwarderConfig {
            queue_capacity: 16,
            max_attempts: 2,
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_delivers_and_confirms() {
        let dir = TempDir::new().unwrap();
        let (queue, remote, connectivity) = setup(&dir).await;
        let forwarder = BackgroundForwarder::spawn(queue.clone(), remote.clone(), connectivity, fast());

        let record = AccessRecord::new("1", Movement::Entry, Utc::now());
        queue.store().save(&record).await.unwrap();
        assert!(forwarder.enqueue(Collection::AccessRecords, record.id.clone()));
        forwarder.wait_idle().await;

        assert_eq!(forwarder.status().delivered, 1);
        assert_eq!(remote.count(Collection::AccessRecords), 1);
        assert_eq!(queue.pending_count(Collection::AccessRecords).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_leaves_record_pending() {
        let dir = TempDir::new().unwrap();
        let (queue, remote, connectivity) = setup(&dir).await;
        remote.set_offline(true);
        let forwarder = BackgroundForwarder::spawn(queue.clone(), remote.clone(), connectivity, fast());

        let record = AccessRecord::new("1", Movement::Entry, Utc::now());
        queue.store().save(&record).await.unwrap();
        forwarder.enqueue(Collection::AccessRecords, record.id.clone());
        forwarder.wait_idle().await;

        assert_eq!(forwarder.status().abandoned, 1);
        assert_eq!(queue.pending_count(Collection::AccessRecords).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_skips_while_offline() {
        let dir = TempDir::new().unwrap();
        let (queue, remote, _) = setup(&dir).await;
        let connectivity = Arc::new(ConnectivityService::new(false));
        let forwarder = BackgroundForwarder::spawn(queue.clone(), remote.clone(), connectivity, fast());

        let record = AccessRecord::new("1", Movement::Exit, Utc::now());
        queue.store().save(&record).await.unwrap();
        forwarder.enqueue(Collection::AccessRecords, record.id.clone());
        forwarder.wait_idle().await;

        assert_eq!(forwarder.status().skipped, 1);
        assert_eq!(remote.upsert_calls(), 0);
    }
}
