//! Retention policies for former students' data

use super::privacy::PrivacyService;
use super::roster::RosterService;
use super::ServiceContext;
use crate::error::{SyncError, SyncResult};
use crate::model::{AuditAction, ExpiryAction, RetentionPolicy, Student, StudentStatus, SyncFlag};
use crate::store::Collection;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Inactive, not yet anonymized students whose retention period has elapsed
pub fn students_due<'a>(
    policy: &RetentionPolicy,
    students: &'a [Student],
    now: DateTime<Utc>,
) -> Vec<&'a Student> {
    if !policy.active || policy.entity_type != Collection::Students.name() {
        return Vec::new();
    }
    let period = Duration::days(i64::from(policy.period_days));
    students
        .iter()
        .filter(|s| s.status == StudentStatus::Inactive && !s.anonymized)
        .filter(|s| s.inactivated_at.map_or(false, |left| left + period <= now))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub anonymized: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct RetentionService {
    ctx: ServiceContext,
    roster: Arc<RosterService>,
    privacy: Arc<PrivacyService>,
}

impl RetentionService {
    pub fn new(ctx: ServiceContext, roster: Arc<RosterService>, privacy: Arc<PrivacyService>) -> Self {
        Self { ctx, roster, privacy }
    }

    pub async fn policies(&self) -> SyncResult<Vec<RetentionPolicy>> {
        self.ctx.store().load_all().await
    }

    pub async fn create_policy(
        &self,
        actor: &str,
        entity_type: Collection,
        period_days: u32,
        action: ExpiryAction,
    ) -> SyncResult<RetentionPolicy> {
        if period_days == 0 {
            return Err(SyncError::InvalidOperation(
                "retention period must be at least one day".to_string(),
            ));
        }
        let policy = RetentionPolicy {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.name().to_string(),
            period_days,
            action,
            active: true,
            sync: SyncFlag::Pending,
        };
        self.ctx.store().insert(&policy).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::RetentionPolicyCreate,
                Collection::RetentionPolicies.name(),
                &policy.id,
                None,
                Some(serde_json::to_value(&policy)?),
            )
            .await?;
        self.ctx.forward(Collection::RetentionPolicies, policy.id.clone());
        Ok(policy)
    }

    /// Students that the active policies would act on now, without changing anything
    pub async fn preview(&self) -> SyncResult<Vec<(RetentionPolicy, Vec<Student>)>> {
        let students: Vec<Student> = self.ctx.store().load_all().await?;
        let now = self.ctx.now();
        Ok(self
            .policies()
            .await?
            .into_iter()
            .map(|policy| {
                let due = students_due(&policy, &students, now).into_iter().cloned().collect();
                (policy, due)
            })
            .collect())
    }

    /// Apply every active policy. Failures on one student do not stop the run.
    pub async fn apply(&self, actor: &str) -> SyncResult<RetentionReport> {
        let mut report = RetentionReport::default();

        for (policy, due) in self.preview().await? {
            for student in due {
                let result = match policy.action {
                    ExpiryAction::Anonymize => self
                        .privacy
                        .anonymize_student(actor, &student.id)
                        .await
                        .map(|_| ()),
                    ExpiryAction::Delete => self.delete_expired(actor, &policy, &student).await,
                };
                match result {
                    Ok(()) => match policy.action {
                        ExpiryAction::Anonymize => report.anonymized.push(student.id.clone()),
                        ExpiryAction::Delete => report.deleted.push(student.id.clone()),
                    },
                    Err(SyncError::AlreadyAnonymized(_)) => {}
                    Err(e) => {
                        tracing::warn!(student_id = %student.id, policy_id = %policy.id, error = %e, "Retention action failed");
                        report.failed.push((student.id.clone(), e.to_string()));
                    }
                }
            }
        }

        tracing::info!(
            anonymized = report.anonymized.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Retention policies applied"
        );
        Ok(report)
    }

    async fn delete_expired(&self, actor: &str, policy: &RetentionPolicy, student: &Student) -> SyncResult<()> {
        self.roster.delete_student(actor, &student.id).await?;
        self.ctx
            .audit
            .record(
                actor,
                AuditAction::RetentionDelete,
                Collection::Students.name(),
                &student.id,
                None,
                Some(json!({"politica_id": policy.id, "periodo_dias": policy.period_days})),
            )
            .await?;
        Ok(())
    }
}
