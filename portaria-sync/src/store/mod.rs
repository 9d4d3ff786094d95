//! Local SQLite store for offline-first operation
//!
//! Provides:
//! - Named collections of JSON documents keyed by a primary key
//! - Secondary indexes used for exact-match scans
//! - Additive schema versioning
//! - Scoped multi-collection transactions

mod raw;
pub mod schema;
mod transaction;

pub use schema::{Collection, SchemaStep, SCHEMA_STEPS, SCHEMA_VERSION, SYNC_FLAG_FIELD};
pub use transaction::{ScopedTransaction, TxMode};

pub(crate) use raw::document_key;

use crate::config::LocalDbConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::Document;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use std::time::Duration;

/// Value compared against a secondary index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    Text(String),
    Integer(i64),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Integer(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        IndexValue::Integer(i64::from(value))
    }
}

/// Handle to the local store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    schema_version: i64,
}

impl LocalStore {
    /// Open (creating if needed) the store and bring it to the current schema
    pub async fn open(config: &LocalDbConfig) -> SyncResult<Self> {
        Self::open_at_version(config, SCHEMA_VERSION).await
    }

    pub(crate) async fn open_at_version(config: &LocalDbConfig, target: i64) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let secure_delete = config.enable_secure_delete;
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // Overwrite freed pages so anonymized data does not linger on disk
                    if secure_delete {
                        conn.execute("PRAGMA secure_delete = ON").await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| {
                SyncError::StorageUnavailable(format!("{}: {}", config.db_path.display(), e))
            })?;

        let schema_version = Self::migrate(&pool, target).await?;

        tracing::info!(
            path = %config.db_path.display(),
            schema_version,
            "Local store opened"
        );

        Ok(Self {
            pool,
            schema_version,
        })
    }

    async fn migrate(pool: &SqlitePool, target: i64) -> SyncResult<i64> {
        let mut tx = pool.begin().await?;
        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;

        if current > SCHEMA_VERSION {
            return Err(SyncError::StorageUnavailable(format!(
                "store schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }

        for step in SCHEMA_STEPS
            .iter()
            .filter(|step| step.version > current && step.version <= target)
        {
            for (collection, indexes) in step.collections {
                sqlx::query(&schema::table_ddl(*collection))
                    .execute(&mut *tx)
                    .await?;
                for field in indexes.iter() {
                    sqlx::query(&schema::index_ddl(*collection, field))
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tracing::info!(
                version = step.version,
                description = step.description,
                "Applied local schema step"
            );
        }

        let version = current.max(target);
        if version != current {
            // PRAGMA does not take bound parameters
            sqlx::query(&format!("PRAGMA user_version = {}", version))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(version)
    }

    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, collection: Collection, key: &str) -> SyncResult<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        raw::fetch(&mut conn, collection, key).await
    }

    pub async fn get_all(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        let mut conn = self.pool.acquire().await?;
        raw::fetch_all(&mut conn, collection).await
    }

    pub async fn get_all_by_index(
        &self,
        collection: Collection,
        field: &str,
        value: impl Into<IndexValue>,
    ) -> SyncResult<Vec<Value>> {
        let mut conn = self.pool.acquire().await?;
        raw::fetch_by_index(&mut conn, collection, field, &value.into()).await
    }

    pub async fn count(&self, collection: Collection) -> SyncResult<u64> {
        let mut conn = self.pool.acquire().await?;
        raw::count(&mut conn, collection).await
    }

    pub async fn count_by_index(
        &self,
        collection: Collection,
        field: &str,
        value: impl Into<IndexValue>,
    ) -> SyncResult<u64> {
        let mut conn = self.pool.acquire().await?;
        raw::count_by_index(&mut conn, collection, field, &value.into()).await
    }

    /// Insert or replace a document, returning its key
    pub async fn put(&self, collection: Collection, doc: &Value) -> SyncResult<String> {
        let mut conn = self.pool.acquire().await?;
        raw::upsert(&mut conn, collection, doc).await
    }

    /// Insert a new document; `DuplicateKey` if it already exists
    pub async fn add(&self, collection: Collection, doc: &Value) -> SyncResult<String> {
        let mut conn = self.pool.acquire().await?;
        raw::insert(&mut conn, collection, doc).await
    }

    pub async fn delete(&self, collection: Collection, key: &str) -> SyncResult<bool> {
        let mut conn = self.pool.acquire().await?;
        raw::delete(&mut conn, collection, key).await
    }

    /// Upsert many documents atomically
    pub async fn put_many(&self, collection: Collection, docs: &[Value]) -> SyncResult<usize> {
        let mut tx = self.transaction(&[collection], TxMode::ReadWrite).await?;
        for doc in docs {
            tx.put(collection, doc).await?;
        }
        tx.commit().await?;
        Ok(docs.len())
    }

    /// Begin a transaction over `scope`. Do not call pool operations on the
    /// same task while it is open.
    pub async fn transaction(
        &self,
        scope: &[Collection],
        mode: TxMode,
    ) -> SyncResult<ScopedTransaction> {
        let tx = self.pool.begin().await?;
        Ok(ScopedTransaction::new(tx, scope, mode))
    }

    pub async fn load<T: Document>(&self, key: &str) -> SyncResult<Option<T>> {
        self.get(T::COLLECTION, key)
            .await?
            .map(|value| serde_json::from_value(value).map_err(SyncError::from))
            .transpose()
    }

    pub async fn load_all<T: Document>(&self) -> SyncResult<Vec<T>> {
        decode_all(self.get_all(T::COLLECTION).await?)
    }

    pub async fn load_by_index<T: Document>(
        &self,
        field: &str,
        value: impl Into<IndexValue>,
    ) -> SyncResult<Vec<T>> {
        decode_all(self.get_all_by_index(T::COLLECTION, field, value).await?)
    }

    pub async fn save<T: Document>(&self, doc: &T) -> SyncResult<()> {
        let value = serde_json::to_value(doc)?;
        self.put(T::COLLECTION, &value).await.map(|_| ())
    }

    pub async fn insert<T: Document>(&self, doc: &T) -> SyncResult<()> {
        let value = serde_json::to_value(doc)?;
        self.add(T::COLLECTION, &value).await.map(|_| ())
    }

    pub async fn remove<T: Document>(&self, key: &str) -> SyncResult<bool> {
        self.delete(T::COLLECTION, key).await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn decode_all<T: Document>(values: Vec<Value>) -> SyncResult<Vec<T>> {
    values
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(SyncError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SchoolClass, Shift, Student, SyncFlag};
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> LocalDbConfig {
        LocalDbConfig {
            db_path: dir.path().join("portaria.db"),
            ..LocalDbConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_creates_current_schema() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();
        assert_eq!(store.schema_version(), SCHEMA_VERSION);
        for collection in Collection::ALL {
            assert_eq!(store.count(collection).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_open_fails_on_unwritable_path() {
        let config = LocalDbConfig {
            db_path: "/nonexistent-dir/portaria/store.db".into(),
            ..LocalDbConfig::default()
        };
        let result = LocalStore::open(&config).await;
        assert!(matches!(result, Err(SyncError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_migration_is_additive() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let v1 = LocalStore::open_at_version(&config, 1).await.unwrap();
        assert_eq!(v1.schema_version(), 1);
        v1.put(
            Collection::Students,
            &json!({"matricula": "1", "nome": "Ana", "status": "ACTIVE", "sincronizado": 1}),
        )
        .await
        .unwrap();
        v1.close().await;

        let current = LocalStore::open(&config).await.unwrap();
        assert_eq!(current.schema_version(), SCHEMA_VERSION);
        assert!(current.get(Collection::Students, "1").await.unwrap().is_some());
        // index added by a later step works on rows written before it
        let active = current
            .get_all_by_index(Collection::Students, "status", "ACTIVE")
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(current.count(Collection::SigningKeys).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let store = LocalStore::open(&config).await.unwrap();
        sqlx::query("PRAGMA user_version = 99")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await;

        let reopened = LocalStore::open(&config).await;
        assert!(matches!(reopened, Err(SyncError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_key() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();
        let class = SchoolClass::new("7", 'a', Shift::Morning, 2025);

        store.insert(&class).await.unwrap();
        let err = store.insert(&class).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateKey { ref key, .. } if key == "7-A"));
    }

    #[tokio::test]
    async fn test_index_scan_matches_flag() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();

        let mut synced = Student::new("1", "Ana", None);
        synced.sync = SyncFlag::Confirmed;
        store.save(&synced).await.unwrap();
        store.save(&Student::new("2", "Bruno", None)).await.unwrap();

        let pending: Vec<Student> = store
            .load_by_index(SYNC_FLAG_FIELD, SyncFlag::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "2");
        assert_eq!(
            store
                .count_by_index(Collection::Students, SYNC_FLAG_FIELD, SyncFlag::Confirmed)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();

        {
            let mut tx = store
                .transaction(&[Collection::Students], TxMode::ReadWrite)
                .await
                .unwrap();
            tx.save(&Student::new("1", "Ana", None)).await.unwrap();
        }

        assert_eq!(store.count(Collection::Students).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transaction_enforces_scope_and_mode() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();

        let mut tx = store
            .transaction(&[Collection::Students], TxMode::ReadOnly)
            .await
            .unwrap();
        assert!(tx.get_all(Collection::Classes).await.is_err());
        assert!(tx.save(&Student::new("1", "Ana", None)).await.is_err());
        assert!(tx.get_all(Collection::Students).await.unwrap().is_empty());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_many_is_atomic_on_bad_document() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(&config_in(&dir)).await.unwrap();

        let docs = vec![json!({"id": "7-A", "serie": "7"}), json!({"serie": "8"})];
        assert!(store.put_many(Collection::Classes, &docs).await.is_err());
        assert_eq!(store.count(Collection::Classes).await.unwrap(), 0);
    }
}
