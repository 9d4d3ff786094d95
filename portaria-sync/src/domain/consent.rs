//! Guardian consent for data processing

use super::ServiceContext;
use crate::error::{SyncError, SyncResult};
use crate::model::{AuditAction, ConsentRecord, Student, SyncFlag};
use crate::store::Collection;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// Consent purpose that gates the student's `consentimento_valido` flag
pub const DATA_PROCESSING: &str = "DATA_PROCESSING";

/// Whether the student holds a valid consent for `purpose` at `at`
pub fn has_valid_consent(
    consents: &[ConsentRecord],
    student_id: &str,
    purpose: &str,
    at: DateTime<Utc>,
) -> bool {
    consents
        .iter()
        .any(|c| c.student_id == student_id && c.purpose == purpose && c.is_valid_at(at))
}

pub struct ConsentService {
    ctx: ServiceContext,
}

impl ConsentService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn consents_for(&self, student_id: &str) -> SyncResult<Vec<ConsentRecord>> {
        self.ctx.store().load_by_index("aluno_id", student_id).await
    }

    pub async fn grant(
        &self,
        actor: &str,
        student_id: &str,
        purpose: &str,
        valid_until: Option<DateTime<Utc>>,
    ) -> SyncResult<ConsentRecord> {
        let student: Student = self
            .ctx
            .store()
            .load(student_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("student {}", student_id)))?;
        if student.anonymized {
            return Err(SyncError::AlreadyAnonymized(student_id.to_string()));
        }

        let now = self.ctx.now();
        let consent = ConsentRecord {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            purpose: purpose.to_string(),
            granted: true,
            granted_at: Some(now),
            valid_until,
            withdrawn: false,
            withdrawn_at: None,
            sync: SyncFlag::Pending,
        };
        self.ctx.store().insert(&consent).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::ConsentGrant,
                Collection::Consents.name(),
                &consent.id,
                None,
                Some(json!({
                    "aluno_id": student_id,
                    "tipo": purpose,
                    "valido_ate": valid_until,
                })),
            )
            .await?;
        self.ctx.forward(Collection::Consents, consent.id.clone());

        self.refresh_student_flag(student_id).await?;
        Ok(consent)
    }

    pub async fn withdraw(&self, actor: &str, consent_id: &str) -> SyncResult<ConsentRecord> {
        let mut consent: ConsentRecord = self
            .ctx
            .store()
            .load(consent_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("consent {}", consent_id)))?;
        if consent.withdrawn {
            return Err(SyncError::AlreadyWithdrawn(consent_id.to_string()));
        }

        consent.withdrawn = true;
        consent.withdrawn_at = Some(self.ctx.now());
        consent.sync = SyncFlag::Pending;
        self.ctx.store().save(&consent).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::ConsentWithdraw,
                Collection::Consents.name(),
                consent_id,
                Some(json!({"revogado": false})),
                Some(json!({"revogado": true, "revogado_em": consent.withdrawn_at})),
            )
            .await?;
        self.ctx.forward(Collection::Consents, consent_id);

        self.refresh_student_flag(&consent.student_id).await?;
        Ok(consent)
    }

    /// Recompute `consentimento_valido` on the student from the stored
    /// consents; writes only when the flag changes
    pub async fn refresh_student_flag(&self, student_id: &str) -> SyncResult<bool> {
        let consents = self.consents_for(student_id).await?;
        let valid = has_valid_consent(&consents, student_id, DATA_PROCESSING, self.ctx.now());

        let Some(mut student) = self.ctx.store().load::<Student>(student_id).await? else {
            return Ok(valid);
        };
        if student.consent_valid != valid && !student.anonymized {
            student.consent_valid = valid;
            student.sync = SyncFlag::Pending;
            self.ctx.store().save(&student).await?;
            self.ctx.forward(Collection::Students, student_id);
        }
        Ok(valid)
    }
}
