#![cfg(feature = "inmem-store")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use disciplina::cache::{DataChanged, EventBus, QueryCache, Topic};
use disciplina::due_process::{UrgencyLevel, DEFAULT_ACTION_TYPES, DEFAULT_STAGES};
use disciplina::models::*;
use disciplina::repo::{inmem::InMemRepo, CaseRepo, RepoError};
use disciplina::retry::RetryPolicy;
use disciplina::service::{CaseService, ServiceError, Upload, MAX_EVIDENCE_BYTES, MAX_INVESTIGATION_DAYS};
use disciplina::stats::StatsRange;
use disciplina::storage::{EvidenceStore, StorageError};
use serial_test::serial;
use tempfile::TempDir;

#[derive(Default)]
struct MockStore {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
    puts: AtomicU32,
    /// Number of initial puts that fail with a network error.
    fail_first: u32,
}

#[async_trait]
impl EvidenceStore for MockStore {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(StorageError::Network("connection reset".into()));
        }
        self.objects
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| (content_type.to_string(), bytes.to_vec()));
        Ok(())
    }
    async fn url(&self, key: &str) -> Result<String, StorageError> {
        if self.objects.lock().unwrap().contains_key(key) {
            Ok(format!("mock://{key}"))
        } else {
            Err(StorageError::Other("no such key".into()))
        }
    }
}

struct Harness {
    _dir: TempDir,
    repo: Arc<InMemRepo>,
    store: Arc<MockStore>,
    service: CaseService,
}

fn harness_with(store: MockStore) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("DISCIPLINA_DATA_DIR", dir.path());
    let repo = Arc::new(InMemRepo::new());
    let store = Arc::new(store);
    let service = CaseService::new(
        repo.clone(),
        store.clone(),
        QueryCache::new(Duration::from_secs(60)),
        EventBus::default(),
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(2)),
        10,
    );
    Harness { _dir: dir, repo, store, service }
}

fn harness() -> Harness {
    harness_with(MockStore::default())
}

fn new_case(course: &str) -> NewCase {
    NewCase {
        incident_at: Utc::now(),
        course: course.into(),
        conduct_type: "Grave".into(),
        conduct_category: "Convivencia".into(),
        description: "Agresión verbal a compañero".into(),
        responsible_name: "Inspectoría General".into(),
        responsible_role: None,
        student: Some(Student { name: "Tomás Rojas".into(), national_id: Some("12.345.678-9".into()) }),
    }
}

fn followup(stage: &str, date: &str) -> NewFollowup {
    NewFollowup {
        action_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        action_type: "Entrevista estudiante".into(),
        process_stage: stage.into(),
        detail: String::new(),
        responsible: "Orientación".into(),
        due_date: None,
    }
}

fn message(body: &str, parent_id: Option<Id>) -> NewMessage {
    NewMessage { body: body.into(), stage: None, parent_id, urgent: false, author: "Orientación".into() }
}

fn closure() -> Closure {
    Closure {
        resolution: "Compromiso firmado".into(),
        measure: None,
        closed_by_name: "Dirección".into(),
        closed_by_role: Some("Director".into()),
    }
}

#[tokio::test]
#[serial]
async fn due_process_view_tracks_stage_progress() {
    let h = harness();
    let c = h.service.create_case(new_case("1A")).await.unwrap();
    let started = h.service.start_due_process(c.id, None).await.unwrap();
    assert!(started.is_tracked());

    // stored labels are normalized, so messy input still lands in its stage
    let f = h.service.add_followup(c.id, followup("  1.  Comunicación al Estudiante ", "2024-05-02")).await.unwrap();
    assert_eq!(f.process_stage, DEFAULT_STAGES[0]);
    h.service.add_followup(c.id, followup(DEFAULT_STAGES[2], "2024-05-04")).await.unwrap();
    h.service.add_followup(c.id, followup("Reunión extraordinaria", "2024-05-03")).await.unwrap();

    let view = h.service.due_process_view(c.id).await.unwrap();
    assert!(view.tracked);
    assert_eq!(view.stages.len(), DEFAULT_STAGES.len());
    assert!(view.stages[0].completed);
    assert!(!view.stages[1].completed);
    assert!(view.stages[1].current);
    assert!(view.stages[2].completed);
    assert_eq!(view.current_stage.as_deref(), Some(DEFAULT_STAGES[1]));
    assert_eq!(view.unstaged.len(), 1);
    assert_eq!(view.deadline.days_remaining, Some(10));
    assert_eq!(view.deadline.urgency, UrgencyLevel::OnTime);
    assert_eq!(view.deadline.label, "on time (10 days left)");
}

#[tokio::test]
#[serial]
async fn configured_stages_replace_defaults() {
    let h = harness();
    h.repo.set_stage_sla(vec![
        StageSla { stage: "Inicio".into(), days: Some(2) },
        StageSla { stage: " Cierre ".into(), days: None },
    ]);
    let stages = h.service.stage_config().await;
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0], StageSla { stage: "Inicio".into(), days: Some(2) });
    assert_eq!(stages[1].stage, "Cierre");

    let c = h.service.create_case(new_case("1B")).await.unwrap();
    let view = h.service.due_process_view(c.id).await.unwrap();
    assert!(!view.tracked);
    assert_eq!(view.stages.len(), 2);
    assert_eq!(view.stages[0].sla_days, Some(2));
    assert_eq!(view.current_stage.as_deref(), Some("Inicio"));
    assert_eq!(view.deadline.urgency, UrgencyLevel::NoDeadline);
}

#[tokio::test]
#[serial]
async fn empty_catalogs_fall_back_to_defaults() {
    let h = harness();
    let stages = h.service.stage_config().await;
    assert_eq!(stages.len(), DEFAULT_STAGES.len());
    assert!(stages.iter().all(|s| s.days.is_none()));
    assert_eq!(h.service.action_types().await.len(), DEFAULT_ACTION_TYPES.len());
}

#[tokio::test]
#[serial]
async fn configured_action_types_are_deduplicated() {
    let h = harness();
    h.repo.set_action_types(vec!["Entrevista".into(), " Entrevista ".into(), "".into(), "Citación".into()]);
    assert_eq!(h.service.action_types().await, vec!["Entrevista".to_string(), "Citación".to_string()]);
}

#[tokio::test]
#[serial]
async fn alerts_list_most_urgent_first() {
    let h = harness();
    let mut ids = Vec::new();
    for days in [2, 10, -3, 0] {
        let c = h.repo.create_case(new_case("2A")).await.unwrap();
        h.repo.start_due_process(c.id, days).await.unwrap();
        ids.push(c.id);
    }
    let closed = h.repo.create_case(new_case("2A")).await.unwrap();
    h.repo.start_due_process(closed.id, -5).await.unwrap();
    h.repo.close_case(closed.id, closure()).await.unwrap();
    h.repo.create_case(new_case("2A")).await.unwrap();

    let alerts = h.service.alerts().await.unwrap();
    let order: Vec<Id> = alerts.iter().map(|a| a.case.id).collect();
    // overdue, due today, due soon; on-time, closed and untracked cases stay out
    assert_eq!(order, vec![ids[2], ids[3], ids[0]]);
    assert_eq!(alerts[0].deadline.label, "overdue by 3 days");
    assert_eq!(alerts[1].deadline.urgency, UrgencyLevel::DueToday);
    assert_eq!(alerts[2].deadline.label, "due in 2 days");
}

#[tokio::test]
#[serial]
async fn invalid_input_is_rejected() {
    let h = harness();
    let mut bad = new_case("1A");
    bad.course = "   ".into();
    assert!(matches!(h.service.create_case(bad).await.unwrap_err(), ServiceError::Invalid(_)));

    assert!(matches!(h.service.get_case(0).await.unwrap_err(), ServiceError::Invalid(_)));
    assert!(matches!(
        h.service.add_followup(-1, followup("Inicio", "2024-01-01")).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    assert!(matches!(
        h.service.update_followup(1, UpdateFollowup::default()).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));

    let c = h.service.create_case(new_case("1A")).await.unwrap();
    assert!(matches!(h.service.start_due_process(c.id, Some(0)).await.unwrap_err(), ServiceError::Invalid(_)));
    assert!(matches!(
        h.service.start_due_process(c.id, Some(MAX_INVESTIGATION_DAYS + 1)).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    assert!(matches!(
        h.service.start_due_process(c.id, Some(1_000_000_000_000)).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    let started = h.service.start_due_process(c.id, Some(MAX_INVESTIGATION_DAYS)).await.unwrap();
    assert!(started.investigation_due_date.is_some());
    let mut no_stage = followup("", "2024-01-01");
    no_stage.process_stage = " ".into();
    assert!(matches!(h.service.add_followup(c.id, no_stage).await.unwrap_err(), ServiceError::Invalid(_)));
}

#[tokio::test]
#[serial]
async fn closed_cases_refuse_more_work() {
    let h = harness();
    let c = h.service.create_case(new_case("3A")).await.unwrap();
    let closed = h.service.close_case(c.id, closure()).await.unwrap();
    assert_eq!(closed.status, CaseStatus::Closed);

    assert!(matches!(h.service.close_case(c.id, closure()).await.unwrap_err(), ServiceError::Invalid(_)));
    assert!(matches!(
        h.service.add_followup(c.id, followup(DEFAULT_STAGES[0], "2024-01-01")).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    match h.service.start_due_process(c.id, None).await.unwrap_err() {
        ServiceError::Rejected(e) => assert_eq!(e.code.as_deref(), Some("P0001")),
        other => panic!("unexpected {other:?}"),
    }
    match h.service.start_due_process(424242, None).await.unwrap_err() {
        ServiceError::Rejected(e) => assert_eq!(e.code.as_deref(), Some("P0002")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn replies_are_one_level_deep() {
    let h = harness();
    let c = h.service.create_case(new_case("4A")).await.unwrap();
    let other = h.service.create_case(new_case("4B")).await.unwrap();

    let top = h.service.post_message(c.id, message("Se citó al apoderado", None)).await.unwrap();
    let reply = h.service.post_message(c.id, message("Confirmado para el lunes", Some(top.id))).await.unwrap();
    assert_eq!(reply.parent_id, Some(top.id));

    assert!(matches!(
        h.service.post_message(c.id, message("Gracias", Some(reply.id))).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    assert!(matches!(
        h.service.post_message(other.id, message("Cruzado", Some(top.id))).await.unwrap_err(),
        ServiceError::Invalid(_)
    ));
    assert!(matches!(
        h.service.post_message(c.id, message("Huérfano", Some(9999))).await.unwrap_err(),
        ServiceError::Repo(RepoError::NotFound)
    ));
    assert_eq!(h.service.list_messages(c.id).await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn mutations_invalidate_cached_reads() {
    let h = harness();
    h.service.create_case(new_case("5A")).await.unwrap();
    assert_eq!(h.service.list_cases(CaseFilter::default()).await.unwrap().len(), 1);

    h.service.create_case(new_case("5A")).await.unwrap();
    assert_eq!(h.service.list_cases(CaseFilter::default()).await.unwrap().len(), 2);

    // writes that bypass the service are invisible until a change event arrives
    h.repo.create_case(new_case("5A")).await.unwrap();
    assert_eq!(h.service.list_cases(CaseFilter::default()).await.unwrap().len(), 2);

    let _listener = h.service.cache().follow(h.service.bus());
    h.service.bus().publish(DataChanged { topic: Topic::Cases, case_id: None });
    let mut seen = 0;
    for _ in 0..50 {
        seen = h.service.list_cases(CaseFilter::default()).await.unwrap().len();
        if seen == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen, 3);
}

#[tokio::test]
#[serial]
async fn evidence_is_content_addressed() {
    let h = harness();
    let c = h.service.create_case(new_case("6A")).await.unwrap();
    let f = h.service.add_followup(c.id, followup(DEFAULT_STAGES[2], "2024-06-01")).await.unwrap();

    let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
    let upload = Upload { file_name: "C:\\fakepath\\foto.png".into(), content_type: None, bytes: png.clone() };
    let first = h.service.attach_to_followup(f.id, upload.clone()).await.unwrap();
    assert_eq!(first.content_type, "image/png");
    assert_eq!(first.file_name, "foto.png");
    assert!(first.storage_path.starts_with(&format!("evidence/{}/", c.id)));
    assert_eq!(first.size, png.len() as i64);

    let second = h.service.attach_to_followup(f.id, upload).await.unwrap();
    assert_eq!(second.storage_path, first.storage_path);
    assert_eq!(h.store.objects.lock().unwrap().len(), 1);
    assert_eq!(h.service.list_followup_evidence(f.id).await.unwrap().len(), 2);

    let url = h.service.evidence_url(first.id).await.unwrap();
    assert_eq!(url.url, format!("mock://{}", first.storage_path));

    // plain text has no magic bytes, the declared type wins
    let m = h.service.post_message(c.id, message("Acta adjunta", None)).await.unwrap();
    let txt = Upload { file_name: "acta.txt".into(), content_type: Some("text/plain".into()), bytes: b"acta de entrevista".to_vec() };
    let att = h.service.attach_to_message(m.id, txt).await.unwrap();
    assert_eq!(att.content_type, "text/plain");
    assert_eq!(att.message_id, Some(m.id));
}

#[tokio::test]
#[serial]
async fn evidence_upload_limits() {
    let h = harness();
    let c = h.service.create_case(new_case("6B")).await.unwrap();
    let f = h.service.add_followup(c.id, followup(DEFAULT_STAGES[0], "2024-06-01")).await.unwrap();

    let empty = Upload { file_name: "a.bin".into(), content_type: None, bytes: Vec::new() };
    assert!(matches!(h.service.attach_to_followup(f.id, empty).await.unwrap_err(), ServiceError::Invalid(_)));
    let huge = Upload { file_name: "a.bin".into(), content_type: None, bytes: vec![0u8; MAX_EVIDENCE_BYTES + 1] };
    assert!(matches!(h.service.attach_to_followup(f.id, huge).await.unwrap_err(), ServiceError::TooLarge(_)));
    let ok = Upload { file_name: "a.bin".into(), content_type: None, bytes: vec![1, 2, 3] };
    assert!(matches!(
        h.service.attach_to_followup(9999, ok).await.unwrap_err(),
        ServiceError::Repo(RepoError::NotFound)
    ));
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[serial]
async fn flaky_storage_is_retried() {
    let h = harness_with(MockStore { fail_first: 2, ..Default::default() });
    let c = h.service.create_case(new_case("7A")).await.unwrap();
    let f = h.service.add_followup(c.id, followup(DEFAULT_STAGES[0], "2024-06-01")).await.unwrap();
    let upload = Upload { file_name: "a.bin".into(), content_type: None, bytes: vec![1, 2, 3] };
    h.service.attach_to_followup(f.id, upload).await.unwrap();
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[serial]
async fn storage_outage_surfaces_after_retries() {
    let h = harness_with(MockStore { fail_first: 10, ..Default::default() });
    let c = h.service.create_case(new_case("7B")).await.unwrap();
    let f = h.service.add_followup(c.id, followup(DEFAULT_STAGES[0], "2024-06-01")).await.unwrap();
    let upload = Upload { file_name: "a.bin".into(), content_type: None, bytes: vec![1, 2, 3] };
    assert!(matches!(h.service.attach_to_followup(f.id, upload).await.unwrap_err(), ServiceError::Storage(_)));
    assert_eq!(h.store.puts.load(Ordering::SeqCst), 3);
    assert!(h.service.list_followup_evidence(f.id).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn stats_cover_all_cases() {
    let h = harness();
    let a = h.service.create_case(new_case("8A")).await.unwrap();
    h.service.create_case(new_case("8B")).await.unwrap();
    h.service.close_case(a.id, closure()).await.unwrap();

    let s = h.service.stats(StatsRange::default()).await.unwrap();
    assert_eq!(s.total, 2);
    assert_eq!(s.closed, 1);
    assert_eq!(s.by_course["8A"], 1);
    assert_eq!(s.by_urgency["no-deadline"], 1);
}
