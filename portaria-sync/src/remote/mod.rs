//! Remote API client seam
//!
//! The engine only talks to the backend through [`RemoteApi`]; `HttpRemote`
//! is the production client and `MemoryRemote` an in-process stand-in with
//! failure injection.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::error::SyncResult;
use crate::store::Collection;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-item status in a batch response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Created,
    Updated,
    Duplicate,
    Error,
    #[serde(other)]
    Unknown,
}

impl AckStatus {
    /// The remote holds the record after this acknowledgment
    pub fn is_confirmed(self) -> bool {
        matches!(
            self,
            AckStatus::Ok | AckStatus::Created | AckStatus::Updated | AckStatus::Duplicate
        )
    }
}

/// Acknowledgment of one record of a batch push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
    pub status: AckStatus,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Full snapshot of a collection
    async fn fetch_all(&self, collection: Collection) -> SyncResult<Vec<Value>>;

    /// Create or update one record; returns the stored record if the remote
    /// echoes it back
    async fn upsert(&self, collection: Collection, record: &Value) -> SyncResult<Option<Value>>;

    /// Create or update many records in one request
    async fn upsert_batch(&self, collection: Collection, records: &[Value]) -> SyncResult<Vec<Ack>>;

    /// Delete by primary key. Deleting a missing record succeeds.
    async fn delete(&self, collection: Collection, key: &str) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_parsing_tolerates_unknown_status() {
        let acks: Vec<Ack> = serde_json::from_str(
            r#"[{"id":"a","status":"created"},{"id":"b","status":"quarantined"},{"id":"c","status":"error"}]"#,
        )
        .unwrap();
        assert!(acks[0].status.is_confirmed());
        assert_eq!(acks[1].status, AckStatus::Unknown);
        assert!(!acks[1].status.is_confirmed());
        assert!(!acks[2].status.is_confirmed());
    }
}
