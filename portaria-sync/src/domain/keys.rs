//! Versioned signing keys for gate QR payloads.
//!
//! Rotation adds a new active key; older keys stay active so badges signed
//! with them keep verifying until an operator deactivates them.

use super::ServiceContext;
use crate::config::PrivacyConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{AuditAction, SigningKeyRecord, SyncFlag};
use crate::store::{Collection, TxMode};
use chrono::{DateTime, Duration, Utc};
use crypto::SigningKeyPair;

/// Highest-version key that is active and not expired
pub fn current_key(keys: &[SigningKeyRecord], now: DateTime<Utc>) -> Option<&SigningKeyRecord> {
    keys.iter()
        .filter(|k| k.active && k.expires_at > now)
        .max_by_key(|k| k.version)
}

/// Active keys superseded by a newer active key for longer than `overlap`
pub fn keys_past_overlap(
    keys: &[SigningKeyRecord],
    now: DateTime<Utc>,
    overlap: Duration,
) -> Vec<u32> {
    let mut versions: Vec<u32> = keys
        .iter()
        .filter(|old| old.active)
        .filter(|old| {
            keys.iter().any(|newer| {
                newer.active && newer.version > old.version && newer.created_at + overlap <= now
            })
        })
        .map(|old| old.version)
        .collect();
    versions.sort_unstable();
    versions
}

/// A payload signed with a specific key version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub key_version: u32,
    pub signature: String,
}

pub struct KeyManager {
    ctx: ServiceContext,
    validity: Duration,
    overlap: Duration,
}

impl KeyManager {
    pub fn new(ctx: ServiceContext, config: &PrivacyConfig) -> Self {
        Self {
            ctx,
            validity: Duration::days(config.key_validity_days),
            overlap: Duration::days(config.key_overlap_days),
        }
    }

    pub async fn keys(&self) -> SyncResult<Vec<SigningKeyRecord>> {
        let mut keys: Vec<SigningKeyRecord> = self.ctx.store().load_all().await?;
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    /// Generate the next key version
    pub async fn rotate_key(&self, actor: &str) -> SyncResult<SigningKeyRecord> {
        let now = self.ctx.now();
        let pair = SigningKeyPair::generate();

        let mut tx = self
            .ctx
            .store()
            .transaction(&[Collection::SigningKeys], TxMode::ReadWrite)
            .await?;
        let existing: Vec<SigningKeyRecord> = tx.load_all().await?;
        let version = existing.iter().map(|k| k.version).max().unwrap_or(0) + 1;

        let key = SigningKeyRecord {
            version,
            public_key: pair.public_key().to_string(),
            private_key: pair.private_key().to_string(),
            active: true,
            created_at: now,
            expires_at: now + self.validity,
            sync: SyncFlag::Pending,
        };
        tx.insert(&key).await?;
        tx.commit().await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::KeyRotate,
                Collection::SigningKeys.name(),
                &version.to_string(),
                None,
                Some(key.public_view()),
            )
            .await?;
        self.ctx.forward(Collection::SigningKeys, version.to_string());

        tracing::info!(version, expires_at = %key.expires_at, "Signing key rotated");
        Ok(key)
    }

    pub async fn current_key(&self) -> SyncResult<Option<SigningKeyRecord>> {
        let keys = self.keys().await?;
        Ok(current_key(&keys, self.ctx.now()).cloned())
    }

    pub async fn deactivate_key(&self, actor: &str, version: u32) -> SyncResult<SigningKeyRecord> {
        let before: SigningKeyRecord = self
            .ctx
            .store()
            .load(&version.to_string())
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("signing key version {}", version)))?;
        if !before.active {
            return Err(SyncError::InvalidOperation(format!(
                "signing key version {} is already inactive",
                version
            )));
        }

        let mut key = before.clone();
        key.active = false;
        key.sync = SyncFlag::Pending;
        self.ctx.store().save(&key).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::KeyDeactivate,
                Collection::SigningKeys.name(),
                &version.to_string(),
                Some(before.public_view()),
                Some(key.public_view()),
            )
            .await?;
        self.ctx.forward(Collection::SigningKeys, version.to_string());
        Ok(key)
    }

    /// Versions that have been superseded long enough to be deactivated
    pub async fn keys_past_overlap(&self) -> SyncResult<Vec<u32>> {
        let keys = self.keys().await?;
        Ok(keys_past_overlap(&keys, self.ctx.now(), self.overlap))
    }

    pub async fn sign(&self, payload: &[u8]) -> SyncResult<SignedPayload> {
        let key = self
            .current_key()
            .await?
            .ok_or_else(|| SyncError::NotFound("no active signing key".to_string()))?;
        let signature = crypto::sign(&key.private_key, payload)?;
        Ok(SignedPayload {
            key_version: key.version,
            signature,
        })
    }

    /// Verify against the named version; inactive keys no longer verify
    pub async fn verify(&self, payload: &[u8], signed: &SignedPayload) -> SyncResult<bool> {
        let Some(key) = self
            .ctx
            .store()
            .load::<SigningKeyRecord>(&signed.key_version.to_string())
            .await?
        else {
            return Ok(false);
        };
        if !key.active {
            return Ok(false);
        }
        Ok(crypto::verify(&key.public_key, payload, &signed.signature).is_ok())
    }
}
