use super::{Ack, AckStatus, RemoteApi};
use crate::error::{SyncError, SyncResult};
use crate::store::{document_key, Collection};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    collections: HashMap<Collection, BTreeMap<String, Value>>,
    offline: bool,
    lost_acks: HashSet<String>,
    rejected: HashSet<String>,
    upserts: usize,
    fetches: usize,
}

/// In-process backend keyed by primary key.
///
/// Failure injection:
/// - `set_offline` makes every call fail with a network error
/// - `lose_ack` stores the next write of a key but reports a failure, like a
///   response lost on the wire
/// - `reject` refuses a key without storing it
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to exercise overlapping syncs
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::default(),
            latency,
        }
    }

    pub fn seed(&self, collection: Collection, records: Vec<Value>) {
        let mut state = self.state.lock();
        let stored = state.collections.entry(collection).or_default();
        for record in records {
            if let Ok(key) = document_key(collection, &record) {
                stored.insert(key, record);
            }
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn lose_ack(&self, key: impl Into<String>) {
        self.state.lock().lost_acks.insert(key.into());
    }

    pub fn reject(&self, key: impl Into<String>) {
        self.state.lock().rejected.insert(key.into());
    }

    pub fn records(&self, collection: Collection) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(&collection)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, collection: Collection, key: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(&collection)
            .and_then(|stored| stored.get(key).cloned())
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.state
            .lock()
            .collections
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Records received through single or batch upserts
    pub fn upsert_calls(&self) -> usize {
        self.state.lock().upserts
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetches
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn ensure_online(state: &MemoryState) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::Network("remote unreachable".to_string()));
        }
        Ok(())
    }

    /// Store one record, reporting whether the caller gets an acknowledgment
    fn store_record(state: &mut MemoryState, collection: Collection, record: &Value) -> SyncResult<AckStatus> {
        let key = document_key(collection, record)?;
        state.upserts += 1;
        if state.rejected.contains(&key) {
            return Ok(AckStatus::Error);
        }
        let previous = state
            .collections
            .entry(collection)
            .or_default()
            .insert(key.clone(), record.clone());
        if state.lost_acks.remove(&key) {
            return Ok(AckStatus::Unknown);
        }
        Ok(if previous.is_some() {
            AckStatus::Updated
        } else {
            AckStatus::Created
        })
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn fetch_all(&self, collection: Collection) -> SyncResult<Vec<Value>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        state.fetches += 1;
        Ok(state
            .collections
            .get(&collection)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, collection: Collection, record: &Value) -> SyncResult<Option<Value>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        match Self::store_record(&mut state, collection, record)? {
            AckStatus::Error => Err(SyncError::Network(format!(
                "remote rejected record in {}",
                collection
            ))),
            AckStatus::Unknown => Err(SyncError::Network("response lost".to_string())),
            _ => Ok(Some(record.clone())),
        }
    }

    async fn upsert_batch(&self, collection: Collection, records: &[Value]) -> SyncResult<Vec<Ack>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            let id = document_key(collection, record)?;
            let status = Self::store_record(&mut state, collection, record)?;
            // A lost acknowledgment is simply missing from the response
            if status != AckStatus::Unknown {
                acks.push(Ack { id, status });
            }
        }
        Ok(acks)
    }

    async fn delete(&self, collection: Collection, key: &str) -> SyncResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        if let Some(stored) = state.collections.get_mut(&collection) {
            stored.remove(key);
        }
        Ok(())
    }
}
