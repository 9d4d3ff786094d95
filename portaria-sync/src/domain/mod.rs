//! School domain services built on the store, audit trail and forwarder.
//!
//! Every mutation follows the same path: write locally with a pending flag,
//! append an audit entry, then hand the record to the background forwarder.

pub mod access;
pub mod attendance;
pub mod consent;
pub mod keys;
pub mod privacy;
pub mod retention;
pub mod risk;
pub mod roster;

use crate::audit::AuditRegistrar;
use crate::forwarder::BackgroundForwarder;
use crate::markers::SyncQueue;
use crate::store::{Collection, LocalStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared dependencies of the domain services
#[derive(Clone)]
pub struct ServiceContext {
    pub queue: SyncQueue,
    pub audit: Arc<AuditRegistrar>,
    pub forwarder: Option<Arc<BackgroundForwarder>>,
}

impl ServiceContext {
    pub fn new(
        queue: SyncQueue,
        audit: Arc<AuditRegistrar>,
        forwarder: Option<Arc<BackgroundForwarder>>,
    ) -> Self {
        Self {
            queue,
            audit,
            forwarder,
        }
    }

    pub fn store(&self) -> &LocalStore {
        self.queue.store()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.queue.clock().now()
    }

    /// Hand a freshly written record to the forwarder, if one is running
    pub fn forward(&self, collection: Collection, key: impl Into<String>) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.enqueue(collection, key);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LocalDbConfig;
    use chrono::TimeZone;
    use tempfile::TempDir;

    /// Context over a fresh store with the clock at 2025-03-10 08:00 local
    pub(crate) async fn context(dir: &TempDir) -> (ServiceContext, Arc<ManualClock>) {
        let config = LocalDbConfig {
            db_path: dir.path().join("domain.db"),
            ..LocalDbConfig::default()
        };
        let store = LocalStore::open(&config).await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 11, 0, 0).unwrap(),
        ));
        let queue = SyncQueue::new(store, clock.clone());
        let audit = Arc::new(AuditRegistrar::new(queue.clone(), None));
        (ServiceContext::new(queue, audit, None), clock)
    }
}
