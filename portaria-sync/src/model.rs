//! Entities persisted in the local store and exchanged with the remote API.
//!
//! Field names on the wire follow the school's backend (Portuguese); the Rust
//! side uses English names with serde renames.

use crate::error::{SyncError, SyncResult};
use crate::store::{Collection, IndexValue};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A typed record stored in one collection under a primary key
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn key(&self) -> String;
}

fn decodes_as<T: Document>(doc: &Value) -> SyncResult<()> {
    T::deserialize(doc).map(|_| ()).map_err(SyncError::from)
}

/// Check that a raw document decodes as the record type of its collection
pub fn check_document(collection: Collection, doc: &Value) -> SyncResult<()> {
    match collection {
        Collection::Students => decodes_as::<Student>(doc),
        Collection::Classes => decodes_as::<SchoolClass>(doc),
        Collection::AccessRecords => decodes_as::<AccessRecord>(doc),
        Collection::PendingOperations => decodes_as::<PendingOperation>(doc),
        Collection::AuditLog => decodes_as::<AuditLogEntry>(doc),
        Collection::Consents => decodes_as::<ConsentRecord>(doc),
        Collection::RetentionPolicies => decodes_as::<RetentionPolicy>(doc),
        Collection::SigningKeys => decodes_as::<SigningKeyRecord>(doc),
    }
}

/// Per-record synchronization flag, stored as `0` (pending) or `1` (confirmed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncFlag {
    #[default]
    Pending,
    Confirmed,
}

impl SyncFlag {
    pub fn as_i64(self) -> i64 {
        match self {
            SyncFlag::Pending => 0,
            SyncFlag::Confirmed => 1,
        }
    }

    pub fn is_pending(self) -> bool {
        self == SyncFlag::Pending
    }

    /// Reads the flag from a raw JSON value. Anything unrecognized is pending.
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) if n.as_i64() == Some(1) => SyncFlag::Confirmed,
            Some(Value::Bool(true)) => SyncFlag::Confirmed,
            Some(Value::String(s)) if s == "1" => SyncFlag::Confirmed,
            _ => SyncFlag::Pending,
        }
    }
}

impl Serialize for SyncFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_i64() as u8)
    }
}

struct SyncFlagVisitor;

impl<'de> Visitor<'de> for SyncFlagVisitor {
    type Value = SyncFlag;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("0, 1 or a boolean")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<SyncFlag, E> {
        Ok(if v { SyncFlag::Confirmed } else { SyncFlag::Pending })
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<SyncFlag, E> {
        match v {
            0 => Ok(SyncFlag::Pending),
            1 => Ok(SyncFlag::Confirmed),
            other => Err(E::custom(format!("invalid sync flag {}", other))),
        }
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<SyncFlag, E> {
        if v < 0 {
            return Err(E::custom(format!("invalid sync flag {}", v)));
        }
        self.visit_u64(v as u64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<SyncFlag, E> {
        match v {
            "0" | "false" => Ok(SyncFlag::Pending),
            "1" | "true" => Ok(SyncFlag::Confirmed),
            other => Err(E::custom(format!("invalid sync flag '{}'", other))),
        }
    }
}

impl<'de> Deserialize<'de> for SyncFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SyncFlagVisitor)
    }
}

impl From<SyncFlag> for IndexValue {
    fn from(flag: SyncFlag) -> Self {
        IndexValue::Integer(flag.as_i64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudentStatus {
    Active,
    Inactive,
    Anonymized,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Active => "ACTIVE",
            StudentStatus::Inactive => "INACTIVE",
            StudentStatus::Anonymized => "ANONYMIZED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    /// Enrollment number, the primary key
    #[serde(rename = "matricula")]
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "turma_id", default)]
    pub class_id: Option<String>,
    pub status: StudentStatus,
    #[serde(rename = "consentimento_valido", default)]
    pub consent_valid: bool,
    #[serde(rename = "inativado_em", default)]
    pub inactivated_at: Option<DateTime<Utc>>,
    #[serde(rename = "anonimizado", default)]
    pub anonymized: bool,
    #[serde(rename = "anonimizado_em", default)]
    pub anonymized_at: Option<DateTime<Utc>>,
    #[serde(rename = "ano_matricula", default)]
    pub enrollment_year: Option<i32>,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl Student {
    pub fn new(id: impl Into<String>, name: impl Into<String>, class_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class_id,
            status: StudentStatus::Active,
            consent_valid: false,
            inactivated_at: None,
            anonymized: false,
            anonymized_at: None,
            enrollment_year: None,
            sync: SyncFlag::Pending,
        }
    }

    pub fn with_enrollment_year(mut self, year: i32) -> Self {
        self.enrollment_year = Some(year);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == StudentStatus::Active
    }
}

impl Document for Student {
    const COLLECTION: Collection = Collection::Students;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Shift {
    Morning,
    Afternoon,
    Evening,
    FullDay,
}

impl Shift {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shift::Morning => "morning",
            Shift::Afternoon => "afternoon",
            Shift::Evening => "evening",
            Shift::FullDay => "full-day",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s.to_lowercase().as_str() {
            "morning" | "manha" => Ok(Shift::Morning),
            "afternoon" | "tarde" => Ok(Shift::Afternoon),
            "evening" | "noite" => Ok(Shift::Evening),
            "full-day" | "integral" => Ok(Shift::FullDay),
            other => Err(SyncError::InvalidOperation(format!("Unknown shift: {}", other))),
        }
    }
}

/// Canonical class identifier: `"<grade>-<LETTER>"`
pub fn class_id(grade: &str, letter: char) -> String {
    format!("{}-{}", grade.trim(), letter.to_ascii_uppercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolClass {
    pub id: String,
    #[serde(rename = "serie")]
    pub grade: String,
    #[serde(rename = "letra")]
    pub letter: char,
    #[serde(rename = "turno")]
    pub shift: Shift,
    #[serde(rename = "ano_letivo")]
    pub school_year: i32,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl SchoolClass {
    pub fn new(grade: impl Into<String>, letter: char, shift: Shift, school_year: i32) -> Self {
        let grade = grade.into();
        Self {
            id: class_id(&grade, letter),
            grade: grade.trim().to_string(),
            letter: letter.to_ascii_uppercase(),
            shift,
            school_year,
            sync: SyncFlag::Pending,
        }
    }
}

impl Document for SchoolClass {
    const COLLECTION: Collection = Collection::Classes;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Movement {
    Entry,
    Exit,
}

impl Movement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Movement::Entry => "ENTRY",
            Movement::Exit => "EXIT",
        }
    }
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: String,
    #[serde(rename = "aluno_id")]
    pub student_id: String,
    #[serde(rename = "tipo")]
    pub movement: Movement,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl AccessRecord {
    pub fn new(student_id: impl Into<String>, movement: Movement, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            movement,
            timestamp,
            sync: SyncFlag::Pending,
        }
    }
}

impl Document for AccessRecord {
    const COLLECTION: Collection = Collection::AccessRecords;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Operation type in the pending-operation queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A queued remote mutation that could not be expressed as a flagged record,
/// most importantly deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    #[serde(rename = "operacao")]
    pub kind: OperationKind,
    #[serde(rename = "colecao")]
    pub collection: Collection,
    #[serde(rename = "alvo_id")]
    pub target_id: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(rename = "criado_em")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "tentativas", default)]
    pub attempts: u32,
    #[serde(rename = "ultimo_erro", default)]
    pub last_error: Option<String>,
}

impl Document for PendingOperation {
    const COLLECTION: Collection = Collection::PendingOperations;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Audited action codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    StudentCreate,
    StudentUpdate,
    StudentInactivate,
    StudentDelete,
    StudentAnonymize,
    ClassCreate,
    ClassUpdate,
    ClassDelete,
    AccessRegister,
    ConsentGrant,
    ConsentWithdraw,
    RetentionPolicyCreate,
    RetentionDelete,
    KeyRotate,
    KeyDeactivate,
    AuditDelete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::StudentCreate => "STUDENT_CREATE",
            AuditAction::StudentUpdate => "STUDENT_UPDATE",
            AuditAction::StudentInactivate => "STUDENT_INACTIVATE",
            AuditAction::StudentDelete => "STUDENT_DELETE",
            AuditAction::StudentAnonymize => "STUDENT_ANONYMIZE",
            AuditAction::ClassCreate => "CLASS_CREATE",
            AuditAction::ClassUpdate => "CLASS_UPDATE",
            AuditAction::ClassDelete => "CLASS_DELETE",
            AuditAction::AccessRegister => "ACCESS_REGISTER",
            AuditAction::ConsentGrant => "CONSENT_GRANT",
            AuditAction::ConsentWithdraw => "CONSENT_WITHDRAW",
            AuditAction::RetentionPolicyCreate => "RETENTION_POLICY_CREATE",
            AuditAction::RetentionDelete => "RETENTION_DELETE",
            AuditAction::KeyRotate => "KEY_ROTATE",
            AuditAction::KeyDeactivate => "KEY_DEACTIVATE",
            AuditAction::AuditDelete => "AUDIT_DELETE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Genesis value for `hash_anterior` of the first entry in the chain
pub const GENESIS_HASH: &str = "0";

/// Append-only audit entry, chained by SHA-256 over its content and the
/// previous entry's hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ator")]
    pub actor: String,
    #[serde(rename = "acao")]
    pub action: AuditAction,
    #[serde(rename = "entidade_tipo")]
    pub target_type: String,
    #[serde(rename = "entidade_id")]
    pub target_id: String,
    #[serde(rename = "dados_anteriores", default)]
    pub before: Option<Value>,
    #[serde(rename = "dados_novos", default)]
    pub after: Option<Value>,
    #[serde(rename = "hash_anterior")]
    pub previous_hash: String,
    pub hash: String,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl AuditLogEntry {
    /// Calculate the chained hash of this entry
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.actor.as_bytes());
        hasher.update(self.action.as_str().as_bytes());
        hasher.update(self.target_type.as_bytes());
        hasher.update(self.target_id.as_bytes());
        hasher.update(snapshot_bytes(&self.before));
        hasher.update(snapshot_bytes(&self.after));
        hasher.update(self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

fn snapshot_bytes(snapshot: &Option<Value>) -> Vec<u8> {
    match snapshot {
        Some(value) => value.to_string().into_bytes(),
        None => b"null".to_vec(),
    }
}

impl Document for AuditLogEntry {
    const COLLECTION: Collection = Collection::AuditLog;

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,
    #[serde(rename = "aluno_id")]
    pub student_id: String,
    /// Purpose of the consent, e.g. `DATA_PROCESSING` or `IMAGE_USE`
    #[serde(rename = "tipo")]
    pub purpose: String,
    #[serde(rename = "concedido")]
    pub granted: bool,
    #[serde(rename = "concedido_em", default)]
    pub granted_at: Option<DateTime<Utc>>,
    #[serde(rename = "valido_ate", default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(rename = "revogado", default)]
    pub withdrawn: bool,
    #[serde(rename = "revogado_em", default)]
    pub withdrawn_at: Option<DateTime<Utc>>,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl ConsentRecord {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.granted && !self.withdrawn && self.valid_until.map_or(true, |until| at <= until)
    }
}

impl Document for ConsentRecord {
    const COLLECTION: Collection = Collection::Consents;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// What happens to records once their retention period has elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpiryAction {
    Anonymize,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    /// Collection name the policy applies to, e.g. `alunos`
    #[serde(rename = "tipo_entidade")]
    pub entity_type: String,
    #[serde(rename = "periodo_dias")]
    pub period_days: u32,
    #[serde(rename = "acao")]
    pub action: ExpiryAction,
    #[serde(rename = "ativa")]
    pub active: bool,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl Document for RetentionPolicy {
    const COLLECTION: Collection = Collection::RetentionPolicies;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Versioned Ed25519 key pair used to sign outgoing payloads
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningKeyRecord {
    #[serde(rename = "versao")]
    pub version: u32,
    #[serde(rename = "chave_publica")]
    pub public_key: String,
    #[serde(rename = "chave_privada")]
    pub private_key: String,
    #[serde(rename = "ativa")]
    pub active: bool,
    #[serde(rename = "criada_em")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expira_em")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "sincronizado", default)]
    pub sync: SyncFlag,
}

impl SigningKeyRecord {
    /// Snapshot safe to put in the audit trail
    pub fn public_view(&self) -> Value {
        serde_json::json!({
            "versao": self.version,
            "chave_publica": self.public_key,
            "ativa": self.active,
            "criada_em": self.created_at,
            "expira_em": self.expires_at,
        })
    }
}

impl fmt::Debug for SigningKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyRecord")
            .field("version", &self.version)
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("sync", &self.sync)
            .finish()
    }
}

impl Document for SigningKeyRecord {
    const COLLECTION: Collection = Collection::SigningKeys;

    fn key(&self) -> String {
        self.version.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_flag_serializes_as_integer() {
        assert_eq!(serde_json::to_value(SyncFlag::Pending).unwrap(), json!(0));
        assert_eq!(serde_json::to_value(SyncFlag::Confirmed).unwrap(), json!(1));
    }

    #[test]
    fn test_sync_flag_accepts_booleans() {
        let flag: SyncFlag = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(flag, SyncFlag::Confirmed);
        let flag: SyncFlag = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(flag, SyncFlag::Pending);
        assert!(serde_json::from_value::<SyncFlag>(json!(7)).is_err());
    }

    #[test]
    fn test_student_wire_names() {
        let student = Student::new("2024001", "Maria Souza", Some("7-A".into())).with_enrollment_year(2024);
        let value = serde_json::to_value(&student).unwrap();
        assert_eq!(value["matricula"], "2024001");
        assert_eq!(value["nome"], "Maria Souza");
        assert_eq!(value["turma_id"], "7-A");
        assert_eq!(value["status"], "ACTIVE");
        assert_eq!(value["sincronizado"], 0);
    }

    #[test]
    fn test_remote_student_without_flag_defaults_to_pending() {
        let student: Student = serde_json::from_value(json!({
            "matricula": "1",
            "nome": "Ana",
            "status": "INACTIVE"
        }))
        .unwrap();
        assert_eq!(student.sync, SyncFlag::Pending);
        assert_eq!(student.status, StudentStatus::Inactive);
    }

    #[test]
    fn test_class_id_is_normalized() {
        assert_eq!(class_id(" 7 ", 'a'), "7-A");
        let class = SchoolClass::new("9", 'b', Shift::FullDay, 2025);
        assert_eq!(class.id, "9-B");
        assert_eq!(serde_json::to_value(&class).unwrap()["turno"], "full-day");
    }

    #[test]
    fn test_audit_hash_detects_tampering() {
        let mut entry = AuditLogEntry {
            id: "e1".into(),
            seq: 0,
            timestamp: Utc::now(),
            actor: "secretaria@escola.br".into(),
            action: AuditAction::StudentCreate,
            target_type: "alunos".into(),
            target_id: "2024001".into(),
            before: None,
            after: Some(json!({"nome": "Maria"})),
            previous_hash: GENESIS_HASH.into(),
            hash: String::new(),
            sync: SyncFlag::Pending,
        };
        entry.hash = entry.compute_hash();
        assert!(entry.verify_hash());

        entry.after = Some(json!({"nome": "Joana"}));
        assert!(!entry.verify_hash());
    }

    #[test]
    fn test_audit_hash_survives_storage_round_trip() {
        let mut entry = AuditLogEntry {
            id: "e2".into(),
            seq: 4,
            timestamp: Utc::now(),
            actor: "system".into(),
            action: AuditAction::KeyRotate,
            target_type: "chaves_assinatura".into(),
            target_id: "2".into(),
            before: None,
            after: Some(json!({"versao": 2, "ativa": true})),
            previous_hash: "abc".into(),
            hash: String::new(),
            sync: SyncFlag::Pending,
        };
        entry.hash = entry.compute_hash();
        let stored = serde_json::to_string(&entry).unwrap();
        let loaded: AuditLogEntry = serde_json::from_str(&stored).unwrap();
        assert!(loaded.verify_hash());
    }

    #[test]
    fn test_consent_validity() {
        let now = Utc::now();
        let mut consent = ConsentRecord {
            id: "c1".into(),
            student_id: "1".into(),
            purpose: "DATA_PROCESSING".into(),
            granted: true,
            granted_at: Some(now),
            valid_until: Some(now + chrono::Duration::days(10)),
            withdrawn: false,
            withdrawn_at: None,
            sync: SyncFlag::Pending,
        };
        assert!(consent.is_valid_at(now));
        assert!(!consent.is_valid_at(now + chrono::Duration::days(11)));
        consent.withdrawn = true;
        assert!(!consent.is_valid_at(now));
    }

    #[test]
    fn test_signing_key_debug_hides_private_key() {
        let key = SigningKeyRecord {
            version: 1,
            public_key: "pub".into(),
            private_key: "very-secret".into(),
            active: true,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            sync: SyncFlag::Pending,
        };
        let debug = format!("{:?}", key);
        assert!(!debug.contains("very-secret"));
        assert!(key.public_view().get("chave_privada").is_none());
        assert_eq!(key.key(), "1");
    }
}
