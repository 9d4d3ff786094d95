//! Students and classes

use super::ServiceContext;
use crate::error::{SyncError, SyncResult};
use crate::model::{class_id, AuditAction, SchoolClass, Shift, Student, StudentStatus, SyncFlag};
use crate::store::Collection;
use serde_json::{json, Value};

/// Audit snapshot of a student without personal data
pub(crate) fn student_snapshot(student: &Student) -> Value {
    json!({
        "matricula": student.id,
        "turma_id": student.class_id,
        "status": student.status,
        "anonimizado": student.anonymized,
    })
}

fn class_snapshot(class: &SchoolClass) -> Value {
    json!({
        "id": class.id,
        "turno": class.shift,
        "ano_letivo": class.school_year,
    })
}

pub struct RosterService {
    ctx: ServiceContext,
}

impl RosterService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn student(&self, id: &str) -> SyncResult<Student> {
        self.ctx
            .store()
            .load(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("student {}", id)))
    }

    pub async fn students(&self) -> SyncResult<Vec<Student>> {
        self.ctx.store().load_all().await
    }

    pub async fn students_in_class(&self, class_id: &str) -> SyncResult<Vec<Student>> {
        self.ctx.store().load_by_index("turma_id", class_id).await
    }

    pub async fn classes(&self) -> SyncResult<Vec<SchoolClass>> {
        self.ctx.store().load_all().await
    }

    pub async fn class(&self, id: &str) -> SyncResult<SchoolClass> {
        self.ctx
            .store()
            .load(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("class {}", id)))
    }

    /// Enroll a student. Fails with `DuplicateKey` for a known enrollment number.
    pub async fn create_student(&self, actor: &str, mut student: Student) -> SyncResult<Student> {
        if student.id.trim().is_empty() || student.name.trim().is_empty() {
            return Err(SyncError::InvalidOperation(
                "student needs an enrollment number and a name".to_string(),
            ));
        }
        if let Some(class_id) = &student.class_id {
            self.class(class_id).await?;
        }
        student.sync = SyncFlag::Pending;
        self.ctx.store().insert(&student).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::StudentCreate,
                Collection::Students.name(),
                &student.id,
                None,
                Some(student_snapshot(&student)),
            )
            .await?;
        self.ctx.forward(Collection::Students, student.id.clone());
        Ok(student)
    }

    /// Change name or class of an existing student
    pub async fn update_student(
        &self,
        actor: &str,
        id: &str,
        name: Option<String>,
        class_id: Option<String>,
    ) -> SyncResult<Student> {
        let before = self.student(id).await?;
        if before.anonymized {
            return Err(SyncError::AlreadyAnonymized(id.to_string()));
        }
        if let Some(class_id) = &class_id {
            self.class(class_id).await?;
        }

        let mut student = before.clone();
        if let Some(name) = name {
            student.name = name;
        }
        if class_id.is_some() {
            student.class_id = class_id;
        }
        student.sync = SyncFlag::Pending;
        self.ctx.store().save(&student).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::StudentUpdate,
                Collection::Students.name(),
                id,
                Some(student_snapshot(&before)),
                Some(student_snapshot(&student)),
            )
            .await?;
        self.ctx.forward(Collection::Students, id);
        Ok(student)
    }

    /// Mark a student as having left the school; starts the retention clock
    pub async fn inactivate_student(&self, actor: &str, id: &str) -> SyncResult<Student> {
        let before = self.student(id).await?;
        if before.status != StudentStatus::Active {
            return Err(SyncError::InvalidOperation(format!(
                "student {} is {}",
                id,
                before.status.as_str()
            )));
        }

        let mut student = before.clone();
        student.status = StudentStatus::Inactive;
        student.inactivated_at = Some(self.ctx.now());
        student.sync = SyncFlag::Pending;
        self.ctx.store().save(&student).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::StudentInactivate,
                Collection::Students.name(),
                id,
                Some(student_snapshot(&before)),
                Some(student_snapshot(&student)),
            )
            .await?;
        self.ctx.forward(Collection::Students, id);
        Ok(student)
    }

    /// Remove a student locally and queue the remote deletion
    pub async fn delete_student(&self, actor: &str, id: &str) -> SyncResult<()> {
        let student = self.student(id).await?;
        if !self.ctx.queue.delete_and_queue(Collection::Students, id).await? {
            return Err(SyncError::NotFound(format!("student {}", id)));
        }

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::StudentDelete,
                Collection::Students.name(),
                id,
                Some(student_snapshot(&student)),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn create_class(
        &self,
        actor: &str,
        grade: &str,
        letter: char,
        shift: Shift,
        school_year: i32,
    ) -> SyncResult<SchoolClass> {
        if grade.trim().is_empty() || !letter.is_ascii_alphabetic() {
            return Err(SyncError::InvalidOperation(format!(
                "invalid class '{}{}'",
                grade, letter
            )));
        }
        let class = SchoolClass::new(grade, letter, shift, school_year);
        self.ctx.store().insert(&class).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::ClassCreate,
                Collection::Classes.name(),
                &class.id,
                None,
                Some(class_snapshot(&class)),
            )
            .await?;
        self.ctx.forward(Collection::Classes, class.id.clone());
        Ok(class)
    }

    /// Change shift or school year. The id, derived from grade and letter,
    /// never changes.
    pub async fn update_class(
        &self,
        actor: &str,
        id: &str,
        shift: Option<Shift>,
        school_year: Option<i32>,
    ) -> SyncResult<SchoolClass> {
        let before = self.class(id).await?;
        let mut class = before.clone();
        if let Some(shift) = shift {
            class.shift = shift;
        }
        if let Some(year) = school_year {
            class.school_year = year;
        }
        class.sync = SyncFlag::Pending;
        self.ctx.store().save(&class).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::ClassUpdate,
                Collection::Classes.name(),
                id,
                Some(class_snapshot(&before)),
                Some(class_snapshot(&class)),
            )
            .await?;
        self.ctx.forward(Collection::Classes, id);
        Ok(class)
    }

    /// Delete an empty class
    pub async fn delete_class(&self, actor: &str, id: &str) -> SyncResult<()> {
        let class = self.class(id).await?;
        let enrolled = self.students_in_class(id).await?;
        if !enrolled.is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "class {} still has {} students",
                id,
                enrolled.len()
            )));
        }

        if !self.ctx.queue.delete_and_queue(Collection::Classes, id).await? {
            return Err(SyncError::NotFound(format!("class {}", id)));
        }
        self.ctx
            .audit
            .record(
                actor,
                AuditAction::ClassDelete,
                Collection::Classes.name(),
                id,
                Some(class_snapshot(&class)),
                None,
            )
            .await?;
        Ok(())
    }

    /// Look a class up by grade and letter
    pub async fn find_class(&self, grade: &str, letter: char) -> SyncResult<Option<SchoolClass>> {
        self.ctx.store().load(&class_id(grade, letter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::domain::testing::context;
    use crate::model::OperationKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_student_is_pending_and_audited() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_class("sec", "7", 'a', Shift::Morning, 2025).await.unwrap();

        let student = roster
            .create_student("sec", Student::new("2025001", "Maria", Some("7-A".into())))
            .await
            .unwrap();
        assert_eq!(student.sync, SyncFlag::Pending);
        assert_eq!(roster.students_in_class("7-A").await.unwrap().len(), 1);

        let entries = ctx.audit.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::StudentCreate);
        assert!(entries[0].after.as_ref().unwrap().get("nome").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_student_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx);
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();

        let err = roster
            .create_student("sec", Student::new("1", "Outra Ana", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_unknown_class_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx);
        let err = roster
            .create_student("sec", Student::new("1", "Ana", Some("9-Z".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_class_update_keeps_id() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx);
        roster.create_class("sec", "8", 'b', Shift::Morning, 2025).await.unwrap();

        let updated = roster
            .update_class("sec", "8-B", Some(Shift::Afternoon), Some(2026))
            .await
            .unwrap();
        assert_eq!(updated.id, "8-B");
        assert_eq!(updated.shift, Shift::Afternoon);
        assert!(roster.find_class("8", 'B').await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_queues_remote_operation() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_class("sec", "6", 'c', Shift::Evening, 2025).await.unwrap();
        roster.create_student("sec", Student::new("1", "Ana", Some("6-C".into()))).await.unwrap();

        assert!(roster.delete_class("sec", "6-C").await.is_err());
        roster.delete_student("sec", "1").await.unwrap();
        roster.delete_class("sec", "6-C").await.unwrap();

        let ops = ctx.queue.pending_operations().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.kind == OperationKind::Delete));
    }

    #[tokio::test]
    async fn test_pull_after_delete_does_not_restore_student() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();
        ctx.queue.confirm_synced(Collection::Students, &["1".to_string()]).await.unwrap();

        roster.delete_student("sec", "1").await.unwrap();
        let remote = vec![json!({"matricula": "1", "nome": "Ana", "status": "ACTIVE"})];
        ctx.queue.pull_replace(Collection::Students, remote).await.unwrap();

        assert!(ctx.store().get(Collection::Students, "1").await.unwrap().is_none());
        assert!(matches!(
            roster.delete_student("sec", "1").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inactivation_records_date() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();

        let student = roster.inactivate_student("sec", "1").await.unwrap();
        assert_eq!(student.status, StudentStatus::Inactive);
        assert_eq!(student.inactivated_at, Some(ctx.now()));
        assert!(roster.inactivate_student("sec", "1").await.is_err());
    }
}
