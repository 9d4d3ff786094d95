use super::raw;
use super::schema::Collection;
use super::IndexValue;
use crate::error::{SyncError, SyncResult};
use crate::model::Document;
use serde_json::Value;
use sqlx::{Sqlite, Transaction};

/// Access mode of a scoped transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Atomic unit of work over a declared set of collections.
///
/// Touching a collection outside the scope, or writing in read-only mode, is
/// rejected. Dropping the transaction without `commit` rolls it back.
pub struct ScopedTransaction {
    tx: Transaction<'static, Sqlite>,
    scope: Vec<Collection>,
    mode: TxMode,
}

impl ScopedTransaction {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>, scope: &[Collection], mode: TxMode) -> Self {
        Self {
            tx,
            scope: scope.to_vec(),
            mode,
        }
    }

    fn check(&self, collection: Collection, write: bool) -> SyncResult<()> {
        if !self.scope.contains(&collection) {
            return Err(SyncError::InvalidOperation(format!(
                "collection {} is outside the transaction scope",
                collection
            )));
        }
        if write && self.mode == TxMode::ReadOnly {
            return Err(SyncError::InvalidOperation(format!(
                "write to {} in a read-only transaction",
                collection
            )));
        }
        Ok(())
    }

    pub async fn get(&mut self, collection: Collection, key: &str) -> SyncResult<Option<Value>> {
        self.check(collection, false)?;
        raw::fetch(&mut self.tx, collection, key).await
    }

    pub async fn get_all(&mut self, collection: Collection) -> SyncResult<Vec<Value>> {
        self.check(collection, false)?;
        raw::fetch_all(&mut self.tx, collection).await
    }

    pub async fn get_all_by_index(
        &mut self,
        collection: Collection,
        field: &str,
        value: impl Into<IndexValue>,
    ) -> SyncResult<Vec<Value>> {
        self.check(collection, false)?;
        raw::fetch_by_index(&mut self.tx, collection, field, &value.into()).await
    }

    pub async fn count(&mut self, collection: Collection) -> SyncResult<u64> {
        self.check(collection, false)?;
        raw::count(&mut self.tx, collection).await
    }

    pub async fn put(&mut self, collection: Collection, doc: &Value) -> SyncResult<String> {
        self.check(collection, true)?;
        raw::upsert(&mut self.tx, collection, doc).await
    }

    pub async fn add(&mut self, collection: Collection, doc: &Value) -> SyncResult<String> {
        self.check(collection, true)?;
        raw::insert(&mut self.tx, collection, doc).await
    }

    pub async fn delete(&mut self, collection: Collection, key: &str) -> SyncResult<bool> {
        self.check(collection, true)?;
        raw::delete(&mut self.tx, collection, key).await
    }

    pub async fn clear(&mut self, collection: Collection) -> SyncResult<u64> {
        self.check(collection, true)?;
        raw::clear(&mut self.tx, collection).await
    }

    pub async fn load<T: Document>(&mut self, key: &str) -> SyncResult<Option<T>> {
        self.get(T::COLLECTION, key)
            .await?
            .map(|value| serde_json::from_value(value).map_err(SyncError::from))
            .transpose()
    }

    pub async fn load_all<T: Document>(&mut self) -> SyncResult<Vec<T>> {
        self.get_all(T::COLLECTION)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(SyncError::from))
            .collect()
    }

    pub async fn save<T: Document>(&mut self, doc: &T) -> SyncResult<()> {
        let value = serde_json::to_value(doc)?;
        self.put(T::COLLECTION, &value).await.map(|_| ())
    }

    pub async fn insert<T: Document>(&mut self, doc: &T) -> SyncResult<()> {
        let value = serde_json::to_value(doc)?;
        self.add(T::COLLECTION, &value).await.map(|_| ())
    }

    pub async fn commit(self) -> SyncResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> SyncResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
