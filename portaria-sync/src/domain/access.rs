//! Gate movements and the live presence board

use super::attendance::{current_presence, AttendancePolicy};
use super::ServiceContext;
use crate::error::{SyncError, SyncResult};
use crate::model::{AccessRecord, AuditAction, Movement, SchoolClass, Student};
use crate::store::Collection;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

/// One row of the presence board
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub student_id: String,
    pub name: String,
    pub class_id: Option<String>,
    /// Latest movement today; `None` if the student has not been seen
    pub movement: Option<Movement>,
}

impl PresenceEntry {
    pub fn is_inside(&self) -> bool {
        self.movement == Some(Movement::Entry)
    }
}

pub struct AccessService {
    ctx: ServiceContext,
    policy: AttendancePolicy,
}

impl AccessService {
    pub fn new(ctx: ServiceContext, policy: AttendancePolicy) -> Self {
        Self { ctx, policy }
    }

    /// Record a student passing the gate. Returns immediately after the local
    /// write; the upload happens in the background.
    pub async fn register_movement(
        &self,
        actor: &str,
        student_id: &str,
        movement: Movement,
    ) -> SyncResult<AccessRecord> {
        let student: Student = self
            .ctx
            .store()
            .load(student_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("student {}", student_id)))?;
        if !student.is_active() {
            return Err(SyncError::InvalidOperation(format!(
                "student {} is {}",
                student_id,
                student.status.as_str()
            )));
        }

        let record = AccessRecord::new(student_id, movement, self.ctx.now());
        self.ctx.store().insert(&record).await?;

        self.ctx
            .audit
            .record(
                actor,
                AuditAction::AccessRegister,
                Collection::AccessRecords.name(),
                &record.id,
                None,
                Some(json!({
                    "aluno_id": record.student_id,
                    "tipo": record.movement,
                    "timestamp": record.timestamp,
                })),
            )
            .await?;
        self.ctx.forward(Collection::AccessRecords, record.id.clone());

        tracing::info!(
            record_id = %record.id,
            student_id,
            movement = %movement,
            "Movement registered"
        );
        Ok(record)
    }

    pub async fn records_for(&self, student_id: &str) -> SyncResult<Vec<AccessRecord>> {
        let mut records: Vec<AccessRecord> =
            self.ctx.store().load_by_index("aluno_id", student_id).await?;
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    pub async fn all_records(&self) -> SyncResult<Vec<AccessRecord>> {
        self.ctx.store().load_all().await
    }

    /// Whether a movement at the current time would be a late entry or an
    /// early departure for the student's class
    pub async fn is_irregular(&self, student: &Student, movement: Movement) -> SyncResult<bool> {
        let Some(class_id) = &student.class_id else {
            return Ok(false);
        };
        let Some(class) = self.ctx.store().load::<SchoolClass>(class_id).await? else {
            return Ok(false);
        };
        let now = self.ctx.now();
        Ok(match movement {
            Movement::Entry => self.policy.is_late(class.shift, now),
            Movement::Exit => self.policy.is_early_departure(class.shift, now),
        })
    }

    /// Presence of every active student, considering today's records only
    pub async fn presence_board(&self) -> SyncResult<Vec<PresenceEntry>> {
        let now = self.ctx.now();
        let since = self.policy.start_of_local_day(now);
        let students: Vec<Student> = self.ctx.store().load_all().await?;
        let records = self.all_records().await?;

        let mut by_student: HashMap<&str, Vec<AccessRecord>> = HashMap::new();
        for record in &records {
            by_student
                .entry(record.student_id.as_str())
                .or_default()
                .push(record.clone());
        }

        Ok(students
            .into_iter()
            .filter(Student::is_active)
            .map(|student| {
                let movement = by_student
                    .get(student.id.as_str())
                    .and_then(|own| current_presence(own, &student.id, now, Some(since)));
                PresenceEntry {
                    student_id: student.id,
                    name: student.name,
                    class_id: student.class_id,
                    movement,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::roster::RosterService;
    use crate::domain::testing::context;
    use crate::model::{Shift, SyncFlag};
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_register_movement_writes_pending_record() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();
        let access = AccessService::new(ctx.clone(), AttendancePolicy::default());

        let record = access.register_movement("porteiro", "1", Movement::Entry).await.unwrap();
        assert_eq!(record.sync, SyncFlag::Pending);
        assert_eq!(access.records_for("1").await.unwrap().len(), 1);
        assert_eq!(ctx.queue.pending_count(Collection::AccessRecords).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_or_inactive_student_cannot_pass() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();
        roster.inactivate_student("sec", "1").await.unwrap();
        let access = AccessService::new(ctx, AttendancePolicy::default());

        assert!(matches!(
            access.register_movement("porteiro", "2", Movement::Entry).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            access.register_movement("porteiro", "1", Movement::Entry).await,
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_board_tracks_latest_movement_today() {
        let dir = TempDir::new().unwrap();
        let (ctx, clock) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_student("sec", Student::new("1", "Ana", None)).await.unwrap();
        roster.create_student("sec", Student::new("2", "Bruno", None)).await.unwrap();
        let access = AccessService::new(ctx, AttendancePolicy::default());

        access.register_movement("porteiro", "1", Movement::Entry).await.unwrap();
        clock.advance(Duration::minutes(30));
        access.register_movement("porteiro", "2", Movement::Entry).await.unwrap();
        clock.advance(Duration::hours(4));
        access.register_movement("porteiro", "2", Movement::Exit).await.unwrap();

        let board = access.presence_board().await.unwrap();
        let ana = board.iter().find(|e| e.student_id == "1").unwrap();
        let bruno = board.iter().find(|e| e.student_id == "2").unwrap();
        assert!(ana.is_inside());
        assert_eq!(bruno.movement, Some(Movement::Exit));

        // next morning nobody has been seen yet
        clock.advance(Duration::hours(20));
        let board = access.presence_board().await.unwrap();
        assert!(board.iter().all(|e| e.movement.is_none()));
    }

    #[tokio::test]
    async fn test_late_entry_is_irregular() {
        let dir = TempDir::new().unwrap();
        let (ctx, clock) = context(&dir).await;
        let roster = RosterService::new(ctx.clone());
        roster.create_class("sec", "7", 'A', Shift::Morning, 2025).await.unwrap();
        let student = roster
            .create_student("sec", Student::new("1", "Ana", Some("7-A".into())))
            .await
            .unwrap();
        let access = AccessService::new(ctx, AttendancePolicy::default());

        // context clock starts at 08:00 local, past the 07:15 cutoff
        assert!(access.is_irregular(&student, Movement::Entry).await.unwrap());
        clock.advance(Duration::minutes(-60));
        assert!(!access.is_irregular(&student, Movement::Entry).await.unwrap());
    }
}
