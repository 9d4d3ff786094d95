//! End-to-end school workflows through the sync engine
//!
//! The engine runs offline so every record stays local and pending.

use chrono::{DateTime, Duration, TimeZone, Utc};
use portaria_sync::domain::attendance::current_presence;
use portaria_sync::domain::risk::{risk_list, RiskFactor, RISK_LIST_THRESHOLD};
use portaria_sync::{
    AccessRecord, AuditAction, AuditFilter, Clock, ClockService, Collection, ConnectivityService, EngineConfig,
    ManualClock, MemoryRemote, Movement, SessionIdentity, Shift, StudentStatus, Student, SyncEngine,
    SyncError, SyncFlag,
};
use std::sync::Arc;
use tempfile::TempDir;

const SECRETARY: &str = "secretaria@escola.br";
const DIRECTOR: &str = "diretoria@escola.br";

struct School {
    _dir: TempDir,
    engine: SyncEngine,
    clock: Arc<ManualClock>,
    identity: Arc<SessionIdentity>,
}

/// Monday 2025-03-10 at the given local time (UTC-3)
fn local(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, hour + 3, minute, 0).unwrap()
}

async fn school() -> School {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = EngineConfig::default();
    config.database.db_path = dir.path().join("escola.db");
    config.privacy.super_admin = Some(DIRECTOR.to_string());

    let clock = Arc::new(ManualClock::new(local(8, 0)));
    let identity = Arc::new(SessionIdentity::signed_in(SECRETARY, None));
    let engine = SyncEngine::new(
        config,
        Arc::new(MemoryRemote::new()),
        identity.clone(),
        Arc::new(ClockService::new(clock.clone())),
        Arc::new(ConnectivityService::new(false)),
    )
    .await
    .expect("Failed to create engine");

    School {
        _dir: dir,
        engine,
        clock,
        identity,
    }
}

/// Creates class 9-A (morning) with student 2024001
async fn enroll(school: &School) -> Student {
    let engine = &school.engine;
    let actor = engine.actor();
    let class = engine
        .roster()
        .create_class(&actor, "9", 'A', Shift::Morning, 2025)
        .await
        .unwrap();
    engine
        .roster()
        .create_student(&actor, Student::new("2024001", "Carla Souza", Some(class.id)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_entry_before_cutoff_is_on_time() {
    let school = school().await;
    let student = enroll(&school).await;
    let engine = &school.engine;
    let policy = &engine.config().attendance;

    school.clock.set(local(7, 10));
    assert!(!engine.access().is_irregular(&student, Movement::Entry).await.unwrap());
    let on_time = engine
        .access()
        .register_movement(&engine.actor(), &student.id, Movement::Entry)
        .await
        .unwrap();
    assert!(!policy.is_late(Shift::Morning, on_time.timestamp));

    school.clock.set(local(7, 20));
    assert!(engine.access().is_irregular(&student, Movement::Entry).await.unwrap());
    let late = engine
        .access()
        .register_movement(&engine.actor(), &student.id, Movement::Entry)
        .await
        .unwrap();
    assert!(policy.is_late(Shift::Morning, late.timestamp));
    assert_eq!(late.sync, SyncFlag::Pending);
}

#[tokio::test]
async fn test_presence_follows_latest_movement() {
    let t1 = local(7, 0);
    let t2 = local(10, 0);
    let t3 = local(11, 0);
    let records = vec![
        AccessRecord::new("2024001", Movement::Entry, t1),
        AccessRecord::new("2024001", Movement::Exit, t2),
        AccessRecord::new("2024001", Movement::Entry, t3),
    ];

    assert_eq!(current_presence(&records, "2024001", t3, None), Some(Movement::Entry));
    assert_eq!(
        current_presence(&records, "2024001", t3 + Duration::hours(5), None),
        Some(Movement::Entry)
    );
    assert_eq!(
        current_presence(&records, "2024001", t2 + Duration::minutes(30), None),
        Some(Movement::Exit)
    );
    assert_eq!(current_presence(&records, "2024001", t1 - Duration::minutes(1), None), None);
}

#[tokio::test]
async fn test_presence_board_reflects_gate_movements() {
    let school = school().await;
    let student = enroll(&school).await;
    let engine = &school.engine;
    let actor = engine.actor();

    school.clock.set(local(7, 5));
    engine.access().register_movement(&actor, &student.id, Movement::Entry).await.unwrap();
    school.clock.set(local(9, 0));
    engine.access().register_movement(&actor, &student.id, Movement::Exit).await.unwrap();

    let board = engine.access().presence_board().await.unwrap();
    assert_eq!(board.len(), 1);
    assert!(!board[0].is_inside());

    school.clock.set(local(9, 30));
    engine.access().register_movement(&actor, &student.id, Movement::Entry).await.unwrap();
    let board = engine.access().presence_board().await.unwrap();
    assert!(board[0].is_inside());
}

#[tokio::test]
async fn test_absent_student_is_always_on_risk_list() {
    let school = school().await;
    enroll(&school).await;
    let engine = &school.engine;

    let students = engine.roster().students().await.unwrap();
    let classes = engine.roster().classes().await.unwrap();
    let records = engine.access().all_records().await.unwrap();
    let list = risk_list(
        &students,
        &classes,
        &records,
        engine.clock().now(),
        &engine.config().attendance,
    );

    assert_eq!(list.len(), 1);
    let entry = &list[0];
    assert_eq!(entry.student_id, "2024001");
    assert!(entry.metrics.last_7.business_days >= 1);
    assert!(entry.assessment.factors.contains(&RiskFactor::NoRecentPresence));
    assert!(entry.assessment.score >= 4);
    assert!(entry.assessment.score >= RISK_LIST_THRESHOLD);
}

#[tokio::test]
async fn test_anonymizing_twice_leaves_record_untouched() {
    let school = school().await;
    let student = enroll(&school).await;
    let engine = &school.engine;
    let actor = engine.actor();

    let refused = engine.privacy().anonymize_student(&actor, &student.id).await;
    assert!(matches!(refused, Err(SyncError::StillActive(_))));

    engine.roster().inactivate_student(&actor, &student.id).await.unwrap();
    let anonymized = engine.privacy().anonymize_student(&actor, &student.id).await.unwrap();
    assert_eq!(anonymized.status, StudentStatus::Anonymized);
    assert!(anonymized.name.starts_with("ANON-"));

    let before = engine.store().get(Collection::Students, &student.id).await.unwrap();
    school.clock.advance(Duration::days(1));
    let again = engine.privacy().anonymize_student(&actor, &student.id).await;
    assert!(matches!(again, Err(SyncError::AlreadyAnonymized(_))));
    let after = engine.store().get(Collection::Students, &student.id).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_two_rotations_leave_both_keys_active() {
    let school = school().await;
    let engine = &school.engine;
    let actor = engine.actor();

    let first = engine.keys().rotate_key(&actor).await.unwrap();
    let second = engine.keys().rotate_key(&actor).await.unwrap();

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    let keys = engine.keys().keys().await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.active));

    let rotations = engine
        .audit()
        .query(&AuditFilter {
            action: Some(AuditAction::KeyRotate),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(rotations.len(), 2);
}

#[tokio::test]
async fn test_audit_chain_covers_every_mutation() {
    let school = school().await;
    let student = enroll(&school).await;
    let engine = &school.engine;
    let actor = engine.actor();

    engine.access().register_movement(&actor, &student.id, Movement::Entry).await.unwrap();
    engine
        .roster()
        .update_student(&actor, &student.id, Some("Carla S. Souza".to_string()), None)
        .await
        .unwrap();

    let log = engine.audit().query(&AuditFilter::default()).await.unwrap();
    assert_eq!(log.len(), 4);
    assert!(log.iter().all(|entry| entry.actor == SECRETARY));

    let verification = engine.audit().verify_chain().await.unwrap();
    assert!(verification.is_valid());
    assert_eq!(verification.entries, 4);

    let debt = engine.sync().sync_debt().await.unwrap();
    assert_eq!(debt.per_collection.get(Collection::AuditLog.name()), Some(&4));
}

#[tokio::test]
async fn test_only_super_admin_deletes_audit_entries() {
    let school = school().await;
    enroll(&school).await;
    let engine = &school.engine;
    let entry = engine.audit().query(&AuditFilter::default()).await.unwrap()[0].clone();

    let refused = engine.delete_audit_entry(&entry.id, true).await;
    assert!(matches!(refused, Err(SyncError::InvalidOperation(_))));

    school.identity.sign_in(DIRECTOR, None);
    engine.delete_audit_entry(&entry.id, true).await.unwrap();

    let remaining = engine.audit().query(&AuditFilter::default()).await.unwrap();
    assert!(remaining.iter().all(|e| e.id != entry.id));
    assert!(remaining
        .iter()
        .any(|e| e.action == AuditAction::AuditDelete && e.actor == DIRECTOR));
}
