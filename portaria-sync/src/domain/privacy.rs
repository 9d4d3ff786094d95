//! LGPD anonymization of former students

use super::roster::student_snapshot;
use super::ServiceContext;
use crate::error::{SyncError, SyncResult};
use crate::model::{AuditAction, Student, StudentStatus, SyncFlag};
use crate::store::Collection;
use chrono::{DateTime, Utc};
use crypto::pseudonymous_token;

/// Replace a student's personal data with a stable pseudonym.
///
/// Only the class, the enrollment year and the identifier survive, so
/// aggregate statistics and access history stay consistent. Active students
/// cannot be anonymized.
pub fn anonymize(student: &Student, now: DateTime<Utc>) -> SyncResult<Student> {
    if student.anonymized || student.status == StudentStatus::Anonymized {
        return Err(SyncError::AlreadyAnonymized(student.id.clone()));
    }
    if student.status == StudentStatus::Active {
        return Err(SyncError::StillActive(student.id.clone()));
    }

    Ok(Student {
        id: student.id.clone(),
        name: pseudonymous_token(&student.id),
        class_id: student.class_id.clone(),
        status: StudentStatus::Anonymized,
        consent_valid: false,
        inactivated_at: None,
        anonymized: true,
        anonymized_at: Some(now),
        enrollment_year: student.enrollment_year,
        sync: SyncFlag::Pending,
    })
}

pub struct PrivacyService {
    ctx: ServiceContext,
}

impl PrivacyService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn anonymize_student(&self, actor: &str, student_id: &str) -> SyncResult<Student> {
        let student: Student = self
            .ctx
            .store()
            .load(student_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("student {}", student_id)))?;

        let anonymized = anonymize(&student, self.ctx.now())?;
        self.ctx.store().save(&anonymized).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::StudentAnonymize,
                Collection::Students.name(),
                student_id,
                Some(student_snapshot(&student)),
                Some(student_snapshot(&anonymized)),
            )
            .await?;
        self.ctx.forward(Collection::Students, student_id);

        tracing::info!(student_id, "Student anonymized");
        Ok(anonymized)
    }
}
