//! Offline-first synchronization engine for Portaria
//!
//! Provides:
//! - Local SQLite store of JSON collections with additive schema versions
//! - Per-record sync markers and a queue of pending deletions
//! - Pull/push synchronization against the school's remote API
//! - Background forwarding of fresh records
//! - Hash-chained audit trail
//! - Attendance, risk, LGPD and signing-key services

pub mod audit;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod domain;
pub mod error;
pub mod forwarder;
pub mod identity;
pub mod markers;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync_service;

pub use audit::{ensure_super_admin, AuditFilter, AuditRegistrar, ChainVerification};
pub use clock::{Clock, ClockService, ManualClock, SystemClock};
pub use config::{EngineConfig, ForwarderConfig, LocalDbConfig, PrivacyConfig, SyncConfig};
pub use connectivity::ConnectivityService;
pub use error::{SyncError, SyncResult};
pub use forwarder::{BackgroundForwarder, ForwarderStatus};
pub use identity::{Identity, IdentityProvider, SessionIdentity, SYSTEM_ACTOR};
pub use markers::{PullOutcome, SyncDebt, SyncQueue};
pub use model::*;
pub use remote::{Ack, AckStatus, HttpRemote, MemoryRemote, RemoteApi};
pub use store::{Collection, IndexValue, LocalStore, ScopedTransaction, TxMode};
pub use sync_service::{CollectionReport, PushReport, ReplayReport, SyncFilter, SyncService, SyncSummary};

use domain::access::AccessService;
use domain::consent::ConsentService;
use domain::keys::KeyManager;
use domain::privacy::PrivacyService;
use domain::retention::RetentionService;
use domain::roster::RosterService;
use domain::ServiceContext;
use std::sync::Arc;

/// Sync engine: the store, the synchronization machinery and the domain
/// services wired together. Must be created inside a Tokio runtime.
pub struct SyncEngine {
    config: EngineConfig,
    store: LocalStore,
    queue: SyncQueue,
    clock: Arc<ClockService>,
    connectivity: Arc<ConnectivityService>,
    identity: Arc<dyn IdentityProvider>,
    forwarder: Arc<BackgroundForwarder>,
    audit: Arc<AuditRegistrar>,
    sync: Arc<SyncService>,
    roster: Arc<RosterService>,
    access: AccessService,
    consent: ConsentService,
    privacy: Arc<PrivacyService>,
    retention: RetentionService,
    keys: KeyManager,
}

impl SyncEngine {
    pub async fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteApi>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<ClockService>,
        connectivity: Arc<ConnectivityService>,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::InvalidOperation)?;

        let store = LocalStore::open(&config.database).await?;
        let queue = SyncQueue::new(store.clone(), clock.clone());

        let forwarder = Arc::new(BackgroundForwarder::spawn(
            queue.clone(),
            remote.clone(),
            connectivity.clone(),
            config.sync.forwarder.clone(),
        ));
        let audit = Arc::new(AuditRegistrar::new(queue.clone(), Some(forwarder.clone())));
        let sync = Arc::new(SyncService::new(
            queue.clone(),
            remote,
            connectivity.clone(),
            config.sync.clone(),
        ));

        let ctx = ServiceContext::new(queue.clone(), audit.clone(), Some(forwarder.clone()));
        let roster = Arc::new(RosterService::new(ctx.clone()));
        let privacy = Arc::new(PrivacyService::new(ctx.clone()));

        Ok(Self {
            access: AccessService::new(ctx.clone(), config.attendance.clone()),
            consent: ConsentService::new(ctx.clone()),
            retention: RetentionService::new(ctx.clone(), roster.clone(), privacy.clone()),
            keys: KeyManager::new(ctx, &config.privacy),
            config,
            store,
            queue,
            clock,
            connectivity,
            identity,
            forwarder,
            audit,
            sync,
            roster,
            privacy,
        })
    }

    /// Actor for audit entries: the signed-in email, or `system`
    pub fn actor(&self) -> String {
        self.identity.actor()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Sync markers and the pending-operation queue
    pub fn sync_queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<ClockService> {
        &self.clock
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityService> {
        &self.connectivity
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn forwarder(&self) -> &Arc<BackgroundForwarder> {
        &self.forwarder
    }

    pub fn audit(&self) -> &Arc<AuditRegistrar> {
        &self.audit
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    pub fn roster(&self) -> &RosterService {
        &self.roster
    }

    pub fn access(&self) -> &AccessService {
        &self.access
    }

    pub fn consent(&self) -> &ConsentService {
        &self.consent
    }

    pub fn privacy(&self) -> &PrivacyService {
        &self.privacy
    }

    pub fn retention(&self) -> &RetentionService {
        &self.retention
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Delete an audit entry as the signed-in super administrator
    pub async fn delete_audit_entry(&self, entry_id: &str, log_deletion: bool) -> SyncResult<()> {
        let actor = ensure_super_admin(
            self.identity.as_ref(),
            self.config.privacy.super_admin.as_deref(),
        )?;
        self.audit.delete_entry(&actor, entry_id, log_deletion).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_engine_creation() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.database.db_path = dir.path().join("engine.db");

        let engine = SyncEngine::new(
            config,
            Arc::new(MemoryRemote::new()),
            Arc::new(SessionIdentity::new()),
            Arc::new(ClockService::system()),
            Arc::new(ConnectivityService::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(engine.actor(), SYSTEM_ACTOR);
        assert_eq!(engine.store().schema_version(), store::SCHEMA_VERSION);
        assert!(engine.forwarder().is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.sync.batch_size = 0;
        let result = SyncEngine::new(
            config,
            Arc::new(MemoryRemote::new()),
            Arc::new(SessionIdentity::new()),
            Arc::new(ClockService::system()),
            Arc::new(ConnectivityService::default()),
        )
        .await;
        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
    }
}
