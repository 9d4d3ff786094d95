//! Collections, secondary indexes and the additive schema history.
//!
//! Every collection is a SQLite table holding `(pk, body)` where `body` is the
//! JSON document. Secondary indexes are expression indexes over
//! `json_extract(body, '$.<field>')`, so an index scan is a plain indexed
//! lookup. Schema steps only ever add tables and indexes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the per-record synchronization flag on every syncable collection
pub const SYNC_FLAG_FIELD: &str = "sincronizado";

/// Current local schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 3;

/// Named partition of the local store; names match the remote API paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "alunos")]
    Students,
    #[serde(rename = "turmas")]
    Classes,
    #[serde(rename = "registros")]
    AccessRecords,
    #[serde(rename = "operacoes_pendentes")]
    PendingOperations,
    #[serde(rename = "logs_auditoria")]
    AuditLog,
    #[serde(rename = "consentimentos")]
    Consents,
    #[serde(rename = "politicas_retencao")]
    RetentionPolicies,
    #[serde(rename = "chaves_assinatura")]
    SigningKeys,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Students,
        Collection::Classes,
        Collection::AccessRecords,
        Collection::PendingOperations,
        Collection::AuditLog,
        Collection::Consents,
        Collection::RetentionPolicies,
        Collection::SigningKeys,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Students => "alunos",
            Collection::Classes => "turmas",
            Collection::AccessRecords => "registros",
            Collection::PendingOperations => "operacoes_pendentes",
            Collection::AuditLog => "logs_auditoria",
            Collection::Consents => "consentimentos",
            Collection::RetentionPolicies => "politicas_retencao",
            Collection::SigningKeys => "chaves_assinatura",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// JSON field holding the primary key
    pub fn key_field(self) -> &'static str {
        match self {
            Collection::Students => "matricula",
            Collection::SigningKeys => "versao",
            _ => "id",
        }
    }

    /// Carries a `sincronizado` flag and is pushed to the remote
    pub fn is_syncable(self) -> bool {
        !matches!(self, Collection::PendingOperations)
    }

    /// Refreshed from the remote with pull-replace. The audit log is push-only.
    pub fn pulls_from_remote(self) -> bool {
        self.is_syncable() && self != Collection::AuditLog
    }

    /// Pushed through the batch endpoint with per-item acknowledgments
    pub fn uses_batch_push(self) -> bool {
        self == Collection::AccessRecords
    }

    /// All collections that take part in a full synchronization
    pub fn syncable() -> impl Iterator<Item = Collection> {
        Self::ALL.into_iter().filter(|c| c.is_syncable())
    }

    /// Secondary indexes declared for this collection across all schema steps
    pub fn indexes(self) -> Vec<&'static str> {
        SCHEMA_STEPS
            .iter()
            .flat_map(|step| step.collections.iter())
            .filter(|(collection, _)| *collection == self)
            .flat_map(|(_, fields)| fields.iter().copied())
            .collect()
    }

    pub fn has_index(self, field: &str) -> bool {
        self.indexes().contains(&field)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One additive schema version
#[derive(Debug)]
pub struct SchemaStep {
    pub version: i64,
    pub description: &'static str,
    /// Collections to create (if missing) with the indexes to add
    pub collections: &'static [(Collection, &'static [&'static str])],
}

pub const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        description: "roster, access records and pending operations",
        collections: &[
            (Collection::Students, &["turma_id", SYNC_FLAG_FIELD]),
            (Collection::Classes, &[SYNC_FLAG_FIELD]),
            (Collection::AccessRecords, &["aluno_id", SYNC_FLAG_FIELD]),
            (Collection::PendingOperations, &["colecao"]),
        ],
    },
    SchemaStep {
        version: 2,
        description: "audit log and LGPD collections",
        collections: &[
            (Collection::AuditLog, &["ator", "acao", SYNC_FLAG_FIELD]),
            (Collection::Consents, &["aluno_id", SYNC_FLAG_FIELD]),
            (Collection::RetentionPolicies, &["tipo_entidade", SYNC_FLAG_FIELD]),
        ],
    },
    SchemaStep {
        version: 3,
        description: "signing keys and student status index",
        collections: &[
            (Collection::SigningKeys, &[SYNC_FLAG_FIELD]),
            (Collection::Students, &["status"]),
        ],
    },
];

pub(crate) fn table_ddl(collection: Collection) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (pk TEXT PRIMARY KEY NOT NULL, body TEXT NOT NULL)",
        collection.name()
    )
}

pub(crate) fn index_expr(field: &str) -> String {
    format!("json_extract(body, '$.{}')", field)
}

pub(crate) fn index_ddl(collection: Collection, field: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{field} ON {table} ({expr})",
        table = collection.name(),
        field = field,
        expr = index_expr(field)
    )
}
