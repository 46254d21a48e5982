use std::time::Duration;

use async_trait::async_trait;

use crate::models::*;
use crate::retry::TransientError;

/// Failure talking to the hosted backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("network error: {message}")]
    Transport { code: Option<String>, message: String },
    #[error("backend error: {message}")]
    Backend { code: Option<String>, message: String },
}

impl TransientError for RemoteError {
    fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Timeout(_) => Some("ETIMEDOUT"),
            RemoteError::Transport { code, .. } | RemoteError::Backend { code, .. } => code.as_deref(),
        }
    }
    fn message(&self) -> String { self.to_string() }
    fn timed_out(after: Duration) -> Self { RemoteError::Timeout(after) }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error(transparent)] Remote(#[from] RemoteError),
}

impl TransientError for RepoError {
    fn code(&self) -> Option<&str> {
        match self {
            RepoError::Remote(e) => e.code(),
            _ => None,
        }
    }
    fn message(&self) -> String { self.to_string() }
    fn timed_out(after: Duration) -> Self { RepoError::Remote(RemoteError::Timeout(after)) }
    fn is_retryable(&self) -> bool {
        matches!(self, RepoError::Remote(e) if e.is_retryable())
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait CaseRepo: Send + Sync {
    async fn list_cases(&self, filter: &CaseFilter) -> RepoResult<Vec<Case>>;
    async fn get_case(&self, id: Id) -> RepoResult<Case>;
    async fn create_case(&self, new: NewCase) -> RepoResult<Case>;
    async fn close_case(&self, id: Id, closure: Closure) -> RepoResult<Case>;
    /// Stored procedure: stamps the follow-up start and the investigation due date.
    async fn start_due_process(&self, id: Id, due_days: i64) -> RepoResult<Envelope<Case>>;
}

#[async_trait]
pub trait FollowupRepo: Send + Sync {
    async fn list_followups(&self, case_id: Id) -> RepoResult<Vec<Followup>>;
    async fn get_followup(&self, id: Id) -> RepoResult<Followup>;
    async fn create_followup(&self, case_id: Id, new: NewFollowup) -> RepoResult<Followup>;
    async fn update_followup(&self, id: Id, upd: UpdateFollowup) -> RepoResult<Followup>;
}

#[async_trait]
pub trait DeadlineRepo: Send + Sync {
    async fn deadline_summaries(&self) -> RepoResult<Vec<DeadlineSummary>>;
    async fn deadline_summary(&self, case_id: Id) -> RepoResult<Option<DeadlineSummary>>;
}

#[async_trait]
pub trait ConfigRepo: Send + Sync {
    async fn stage_sla(&self) -> RepoResult<Vec<StageSla>>;
    async fn action_types(&self) -> RepoResult<Vec<String>>;
}

#[async_trait]
pub trait EvidenceRepo: Send + Sync {
    async fn create_evidence(&self, new: NewEvidence) -> RepoResult<EvidenceFile>;
    async fn get_evidence(&self, id: Id) -> RepoResult<EvidenceFile>;
    async fn list_followup_evidence(&self, followup_id: Id) -> RepoResult<Vec<EvidenceFile>>;
    async fn list_message_evidence(&self, message_id: Id) -> RepoResult<Vec<EvidenceFile>>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn list_messages(&self, case_id: Id) -> RepoResult<Vec<Message>>;
    async fn get_message(&self, id: Id) -> RepoResult<Message>;
    async fn create_message(&self, case_id: Id, new: NewMessage) -> RepoResult<Message>;
}

pub trait Repo: CaseRepo + FollowupRepo + DeadlineRepo + ConfigRepo + EvidenceRepo + MessageRepo {}

impl<T> Repo for T where T: CaseRepo + FollowupRepo + DeadlineRepo + ConfigRepo + EvidenceRepo + MessageRepo {}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use crate::due_process::classify_urgency;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
    use tracing::{info, warn};

    const SNAPSHOT_PATH: &str = "data/state.json";

    // mirrors the error payload of the start_due_process procedure
    fn procedure_error(code: &str, message: &str) -> BackendError {
        BackendError { code: Some(code.into()), message: message.into(), details: None }
    }

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        cases: HashMap<Id, Case>,
        followups: HashMap<Id, Followup>,
        evidence: HashMap<Id, EvidenceFile>,
        messages: HashMap<Id, Message>,
        stage_sla: Vec<StageSla>,
        action_types: Vec<String>,
        next_id: Id,
    }

    /// Process-local backend persisted as a JSON snapshot.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("DISCIPLINA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("DISCIPLINA_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!(path = %path.display(), "loaded snapshot");
                        s
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unparseable snapshot, starting empty");
                        State::default()
                    }
                },
                Err(e) => {
                    info!(path = %path.display(), error = %e, "no snapshot, starting empty");
                    State::default()
                }
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.read()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    warn!(path = %path.display(), error = %e, "failed to write snapshot");
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn read(&self) -> RwLockReadGuard<'_, State> {
            self.state.read().unwrap_or_else(|e| e.into_inner())
        }

        fn write(&self) -> RwLockWriteGuard<'_, State> {
            self.state.write().unwrap_or_else(|e| e.into_inner())
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        /// Replaces the stage configuration (the hosted backend's `stage_sla` table).
        pub fn set_stage_sla(&self, rows: Vec<StageSla>) {
            self.write().stage_sla = rows;
            self.persist();
        }

        pub fn set_action_types(&self, types: Vec<String>) {
            self.write().action_types = types;
            self.persist();
        }

        fn summary_for(case: &Case) -> DeadlineSummary {
            let days_remaining = match (case.closed_at, case.investigation_due_date) {
                (None, Some(due)) => Some((due - Utc::now().date_naive()).num_days()),
                _ => None,
            };
            DeadlineSummary {
                case_id: case.id,
                days_remaining,
                urgency: classify_urgency(days_remaining).level(),
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    #[async_trait]
    impl CaseRepo for InMemRepo {
        async fn list_cases(&self, filter: &CaseFilter) -> RepoResult<Vec<Case>> {
            let s = self.read();
            let mut v: Vec<_> = s.cases.values().filter(|c| filter.matches(c)).cloned().collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(v)
        }
        async fn get_case(&self, id: Id) -> RepoResult<Case> {
            self.read().cases.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_case(&self, new: NewCase) -> RepoResult<Case> {
            let mut s = self.write();
            let id = Self::next_id(&mut s);
            let case = Case {
                id,
                incident_at: new.incident_at,
                course: new.course,
                conduct_type: new.conduct_type,
                conduct_category: new.conduct_category,
                description: new.description,
                status: CaseStatus::Reported,
                responsible_name: new.responsible_name,
                responsible_role: new.responsible_role,
                created_at: Utc::now(),
                closed_at: None,
                closure: None,
                followup_started_at: None,
                investigation_due_date: None,
                student: new.student,
            };
            s.cases.insert(id, case.clone());
            drop(s);
            self.persist();
            Ok(case)
        }
        async fn close_case(&self, id: Id, closure: Closure) -> RepoResult<Case> {
            let mut s = self.write();
            let case = s.cases.get_mut(&id).ok_or(RepoError::NotFound)?;
            if case.closed_at.is_some() {
                return Err(RepoError::Conflict);
            }
            case.closed_at = Some(Utc::now());
            case.status = CaseStatus::Closed;
            case.closure = Some(closure);
            let updated = case.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
        async fn start_due_process(&self, id: Id, due_days: i64) -> RepoResult<Envelope<Case>> {
            let mut s = self.write();
            let Some(case) = s.cases.get_mut(&id) else {
                return Ok(Envelope::err(procedure_error("P0002", "case not found")));
            };
            if case.closed_at.is_some() {
                return Ok(Envelope::err(procedure_error("P0001", "case is closed")));
            }
            if case.followup_started_at.is_some() {
                return Ok(Envelope::ok(case.clone()));
            }
            let now = Utc::now();
            let due = u64::try_from(due_days)
                .ok()
                .and_then(|d| now.date_naive().checked_add_days(chrono::Days::new(d)));
            let Some(due) = due else {
                return Ok(Envelope::err(procedure_error("22008", "due date out of range")));
            };
            case.followup_started_at = Some(now);
            case.investigation_due_date = Some(due);
            case.status = CaseStatus::InFollowUp;
            let updated = case.clone();
            drop(s);
            self.persist();
            Ok(Envelope::ok(updated))
        }
    }

    #[async_trait]
    impl FollowupRepo for InMemRepo {
        async fn list_followups(&self, case_id: Id) -> RepoResult<Vec<Followup>> {
            let s = self.read();
            let mut v: Vec<_> = s.followups.values().filter(|f| f.case_id == case_id).cloned().collect();
            v.sort_by(|a, b| a.action_date.cmp(&b.action_date).then(a.id.cmp(&b.id)));
            Ok(v)
        }
        async fn get_followup(&self, id: Id) -> RepoResult<Followup> {
            self.read().followups.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_followup(&self, case_id: Id, new: NewFollowup) -> RepoResult<Followup> {
            let mut s = self.write();
            if !s.cases.contains_key(&case_id) { return Err(RepoError::NotFound); }
            let id = Self::next_id(&mut s);
            let followup = Followup {
                id,
                case_id,
                action_date: new.action_date,
                action_type: new.action_type,
                process_stage: new.process_stage,
                detail: new.detail,
                responsible: new.responsible,
                due_date: new.due_date,
                created_at: Utc::now(),
            };
            s.followups.insert(id, followup.clone());
            // first recorded action moves a fresh report into follow-up
            if let Some(c) = s.cases.get_mut(&case_id) {
                if c.status == CaseStatus::Reported { c.status = CaseStatus::InFollowUp; }
            }
            drop(s);
            self.persist();
            Ok(followup)
        }
        async fn update_followup(&self, id: Id, upd: UpdateFollowup) -> RepoResult<Followup> {
            let mut s = self.write();
            let f = s.followups.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(detail) = upd.detail { f.detail = detail; }
            if let Some(responsible) = upd.responsible { f.responsible = responsible; }
            if let Some(due) = upd.due_date { f.due_date = Some(due); }
            let updated = f.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl DeadlineRepo for InMemRepo {
        async fn deadline_summaries(&self) -> RepoResult<Vec<DeadlineSummary>> {
            let s = self.read();
            let mut v: Vec<_> = s.cases.values().map(Self::summary_for).collect();
            v.sort_by_key(|d| d.case_id);
            Ok(v)
        }
        async fn deadline_summary(&self, case_id: Id) -> RepoResult<Option<DeadlineSummary>> {
            Ok(self.read().cases.get(&case_id).map(Self::summary_for))
        }
    }

    #[async_trait]
    impl ConfigRepo for InMemRepo {
        async fn stage_sla(&self) -> RepoResult<Vec<StageSla>> {
            Ok(self.read().stage_sla.clone())
        }
        async fn action_types(&self) -> RepoResult<Vec<String>> {
            Ok(self.read().action_types.clone())
        }
    }

    #[async_trait]
    impl EvidenceRepo for InMemRepo {
        async fn create_evidence(&self, new: NewEvidence) -> RepoResult<EvidenceFile> {
            let mut s = self.write();
            let owner_exists = match (new.followup_id, new.message_id) {
                (Some(f), None) => s.followups.contains_key(&f),
                (None, Some(m)) => s.messages.contains_key(&m),
                _ => false,
            };
            if !owner_exists { return Err(RepoError::NotFound); }
            let id = Self::next_id(&mut s);
            let file = EvidenceFile {
                id,
                followup_id: new.followup_id,
                message_id: new.message_id,
                storage_path: new.storage_path,
                file_name: new.file_name,
                content_type: new.content_type,
                size: new.size,
                created_at: Utc::now(),
            };
            s.evidence.insert(id, file.clone());
            drop(s);
            self.persist();
            Ok(file)
        }
        async fn get_evidence(&self, id: Id) -> RepoResult<EvidenceFile> {
            self.read().evidence.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn list_followup_evidence(&self, followup_id: Id) -> RepoResult<Vec<EvidenceFile>> {
            let s = self.read();
            let mut v: Vec<_> = s.evidence.values().filter(|e| e.followup_id == Some(followup_id)).cloned().collect();
            v.sort_by_key(|e| e.id);
            Ok(v)
        }
        async fn list_message_evidence(&self, message_id: Id) -> RepoResult<Vec<EvidenceFile>> {
            let s = self.read();
            let mut v: Vec<_> = s.evidence.values().filter(|e| e.message_id == Some(message_id)).cloned().collect();
            v.sort_by_key(|e| e.id);
            Ok(v)
        }
    }

    #[async_trait]
    impl MessageRepo for InMemRepo {
        async fn list_messages(&self, case_id: Id) -> RepoResult<Vec<Message>> {
            let s = self.read();
            let mut v: Vec<_> = s.messages.values().filter(|m| m.case_id == case_id).cloned().collect();
            v.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(v)
        }
        async fn get_message(&self, id: Id) -> RepoResult<Message> {
            self.read().messages.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_message(&self, case_id: Id, new: NewMessage) -> RepoResult<Message> {
            let mut s = self.write();
            if !s.cases.contains_key(&case_id) { return Err(RepoError::NotFound); }
            let id = Self::next_id(&mut s);
            let msg = Message {
                id,
                case_id,
                body: new.body,
                stage: new.stage,
                parent_id: new.parent_id,
                urgent: new.urgent,
                author: new.author,
                created_at: Utc::now(),
            };
            s.messages.insert(id, msg.clone());
            drop(s);
            self.persist();
            Ok(msg)
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use crate::normalize::{RawCaseRow, RawDeadlineRow, RawFollowupRow};
    use sqlx::types::Json;
    use sqlx::{Pool, Postgres};
    use tracing::error;

    const CASE_ROW: &str = r#"
        SELECT to_jsonb(c) || jsonb_build_object('student', to_jsonb(s))
        FROM cases c LEFT JOIN students s ON s.id = c.student_id
    "#;

    fn io_code(kind: std::io::ErrorKind) -> Option<String> {
        use std::io::ErrorKind::*;
        let code = match kind {
            ConnectionReset => "ECONNRESET",
            ConnectionRefused => "ECONNREFUSED",
            ConnectionAborted => "ECONNABORTED",
            TimedOut => "ETIMEDOUT",
            BrokenPipe => "EPIPE",
            _ => return None,
        };
        Some(code.to_string())
    }

    impl From<sqlx::Error> for RepoError {
        fn from(e: sqlx::Error) -> Self {
            match e {
                sqlx::Error::RowNotFound => RepoError::NotFound,
                sqlx::Error::Database(db) => match db.code().as_deref() {
                    Some("23505") => RepoError::Conflict,
                    Some("23503") => RepoError::NotFound,
                    code => RepoError::Remote(RemoteError::Backend {
                        code: code.map(str::to_string),
                        message: db.message().to_string(),
                    }),
                },
                sqlx::Error::Io(io) => RepoError::Remote(RemoteError::Transport {
                    code: io_code(io.kind()),
                    message: io.to_string(),
                }),
                sqlx::Error::PoolTimedOut => RepoError::Remote(RemoteError::Transport {
                    code: Some("ETIMEDOUT".into()),
                    message: "connection pool timeout".into(),
                }),
                other => {
                    error!(error = %other, "postgres error");
                    RepoError::Remote(RemoteError::Backend { code: None, message: other.to_string() })
                }
            }
        }
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    #[async_trait]
    impl CaseRepo for PgRepo {
        async fn list_cases(&self, filter: &CaseFilter) -> RepoResult<Vec<Case>> {
            // status spellings vary in stored rows; filter after normalization
            let sql = format!("{CASE_ROW} WHERE ($1::text IS NULL OR c.course = $1) ORDER BY c.created_at DESC, c.id DESC");
            let rows = sqlx::query_scalar::<_, Json<RawCaseRow>>(&sql)
                .bind(filter.course.as_ref())
                .fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(|r| r.0.into_case()).filter(|c| filter.matches(c)).collect())
        }
        async fn get_case(&self, id: Id) -> RepoResult<Case> {
            let sql = format!("{CASE_ROW} WHERE c.id = $1");
            let row = sqlx::query_scalar::<_, Json<RawCaseRow>>(&sql)
                .bind(id)
                .fetch_one(&self.pool).await?;
            Ok(row.0.into_case())
        }
        async fn create_case(&self, new: NewCase) -> RepoResult<Case> {
            let mut tx = self.pool.begin().await?;
            let student_id: Option<Id> = match &new.student {
                Some(st) => Some(
                    sqlx::query_scalar("INSERT INTO students (name, national_id) VALUES ($1,$2) RETURNING id")
                        .bind(&st.name).bind(st.national_id.as_ref())
                        .fetch_one(&mut *tx).await?,
                ),
                None => None,
            };
            let id: Id = sqlx::query_scalar(
                "INSERT INTO cases (incident_at, course, conduct_type, conduct_category, description, status, responsible_name, responsible_role, student_id)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING id",
            )
            .bind(new.incident_at)
            .bind(&new.course)
            .bind(&new.conduct_type)
            .bind(&new.conduct_category)
            .bind(&new.description)
            .bind(CaseStatus::Reported.as_str())
            .bind(&new.responsible_name)
            .bind(new.responsible_role.as_ref())
            .bind(student_id)
            .fetch_one(&mut *tx).await?;
            tx.commit().await?;
            self.get_case(id).await
        }
        async fn close_case(&self, id: Id, closure: Closure) -> RepoResult<Case> {
            let updated: Option<Id> = sqlx::query_scalar(
                "UPDATE cases SET status = $2, closed_at = now(), resolution = $3, measure = $4, closed_by_name = $5, closed_by_role = $6
                 WHERE id = $1 AND closed_at IS NULL RETURNING id",
            )
            .bind(id)
            .bind(CaseStatus::Closed.as_str())
            .bind(&closure.resolution)
            .bind(closure.measure.as_ref())
            .bind(&closure.closed_by_name)
            .bind(closure.closed_by_role.as_ref())
            .fetch_optional(&self.pool).await?;
            match updated {
                Some(id) => self.get_case(id).await,
                // distinguish a missing case from an already closed one
                None => self.get_case(id).await.and(Err(RepoError::Conflict)),
            }
        }
        async fn start_due_process(&self, id: Id, due_days: i64) -> RepoResult<Envelope<Case>> {
            let Ok(due_days) = i32::try_from(due_days) else {
                return Ok(Envelope::err(BackendError {
                    code: Some("22003".into()),
                    message: "due_days out of range".into(),
                    details: None,
                }));
            };
            let reply = sqlx::query_scalar::<_, Json<Envelope<RawCaseRow>>>("SELECT start_due_process($1, $2)")
                .bind(id)
                .bind(due_days)
                .fetch_one(&self.pool).await?;
            let Envelope { data, error } = reply.0;
            Ok(Envelope { data: data.map(RawCaseRow::into_case), error })
        }
    }

    #[async_trait]
    impl FollowupRepo for PgRepo {
        async fn list_followups(&self, case_id: Id) -> RepoResult<Vec<Followup>> {
            let rows = sqlx::query_scalar::<_, Json<RawFollowupRow>>(
                "SELECT to_jsonb(f) FROM followups f WHERE f.case_id = $1 ORDER BY f.action_date, f.id",
            )
            .bind(case_id)
            .fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(|r| r.0.into_followup()).collect())
        }
        async fn get_followup(&self, id: Id) -> RepoResult<Followup> {
            let row = sqlx::query_scalar::<_, Json<RawFollowupRow>>("SELECT to_jsonb(f) FROM followups f WHERE f.id = $1")
                .bind(id)
                .fetch_one(&self.pool).await?;
            Ok(row.0.into_followup())
        }
        async fn create_followup(&self, case_id: Id, new: NewFollowup) -> RepoResult<Followup> {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_scalar::<_, Json<RawFollowupRow>>(
                "INSERT INTO followups AS f (case_id, action_date, action_type, process_stage, detail, responsible, due_date)
                 VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING to_jsonb(f)",
            )
            .bind(case_id)
            .bind(new.action_date)
            .bind(&new.action_type)
            .bind(&new.process_stage)
            .bind(&new.detail)
            .bind(&new.responsible)
            .bind(new.due_date)
            .fetch_one(&mut *tx).await?;
            sqlx::query("UPDATE cases SET status = $2 WHERE id = $1 AND status = $3")
                .bind(case_id)
                .bind(CaseStatus::InFollowUp.as_str())
                .bind(CaseStatus::Reported.as_str())
                .execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(row.0.into_followup())
        }
        async fn update_followup(&self, id: Id, upd: UpdateFollowup) -> RepoResult<Followup> {
            let row = sqlx::query_scalar::<_, Json<RawFollowupRow>>(
                "UPDATE followups AS f SET detail = COALESCE($2, detail), responsible = COALESCE($3, responsible), due_date = COALESCE($4, due_date)
                 WHERE f.id = $1 RETURNING to_jsonb(f)",
            )
            .bind(id)
            .bind(upd.detail.as_ref())
            .bind(upd.responsible.as_ref())
            .bind(upd.due_date)
            .fetch_one(&self.pool).await?;
            Ok(row.0.into_followup())
        }
    }

    #[async_trait]
    impl DeadlineRepo for PgRepo {
        async fn deadline_summaries(&self) -> RepoResult<Vec<DeadlineSummary>> {
            let rows = sqlx::query_scalar::<_, Json<RawDeadlineRow>>("SELECT to_jsonb(v) FROM v_deadline_summary v")
                .fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(|r| r.0.into_summary()).collect())
        }
        async fn deadline_summary(&self, case_id: Id) -> RepoResult<Option<DeadlineSummary>> {
            let row = sqlx::query_scalar::<_, Json<RawDeadlineRow>>("SELECT to_jsonb(v) FROM v_deadline_summary v WHERE v.case_id = $1")
                .bind(case_id)
                .fetch_optional(&self.pool).await?;
            Ok(row.map(|r| r.0.into_summary()))
        }
    }

    #[async_trait]
    impl ConfigRepo for PgRepo {
        async fn stage_sla(&self) -> RepoResult<Vec<StageSla>> {
            let rows = sqlx::query_as::<_, StageSla>("SELECT stage, days FROM stage_sla ORDER BY position, stage")
                .fetch_all(&self.pool).await?;
            Ok(rows)
        }
        async fn action_types(&self) -> RepoResult<Vec<String>> {
            let rows = sqlx::query_scalar::<_, String>("SELECT name FROM action_types ORDER BY position, name")
                .fetch_all(&self.pool).await?;
            Ok(rows)
        }
    }

    const EVIDENCE_COLS: &str = "id, followup_id, message_id, storage_path, file_name, content_type, size, created_at";

    #[async_trait]
    impl EvidenceRepo for PgRepo {
        async fn create_evidence(&self, new: NewEvidence) -> RepoResult<EvidenceFile> {
            let sql = format!(
                "INSERT INTO evidence_files (followup_id, message_id, storage_path, file_name, content_type, size)
                 VALUES ($1,$2,$3,$4,$5,$6) RETURNING {EVIDENCE_COLS}"
            );
            let rec = sqlx::query_as::<_, EvidenceFile>(&sql)
                .bind(new.followup_id)
                .bind(new.message_id)
                .bind(&new.storage_path)
                .bind(&new.file_name)
                .bind(&new.content_type)
                .bind(new.size)
                .fetch_one(&self.pool).await?;
            Ok(rec)
        }
        async fn get_evidence(&self, id: Id) -> RepoResult<EvidenceFile> {
            let sql = format!("SELECT {EVIDENCE_COLS} FROM evidence_files WHERE id = $1");
            Ok(sqlx::query_as::<_, EvidenceFile>(&sql).bind(id).fetch_one(&self.pool).await?)
        }
        async fn list_followup_evidence(&self, followup_id: Id) -> RepoResult<Vec<EvidenceFile>> {
            let sql = format!("SELECT {EVIDENCE_COLS} FROM evidence_files WHERE followup_id = $1 ORDER BY id");
            Ok(sqlx::query_as::<_, EvidenceFile>(&sql).bind(followup_id).fetch_all(&self.pool).await?)
        }
        async fn list_message_evidence(&self, message_id: Id) -> RepoResult<Vec<EvidenceFile>> {
            let sql = format!("SELECT {EVIDENCE_COLS} FROM evidence_files WHERE message_id = $1 ORDER BY id");
            Ok(sqlx::query_as::<_, EvidenceFile>(&sql).bind(message_id).fetch_all(&self.pool).await?)
        }
    }

    const MESSAGE_COLS: &str = "id, case_id, body, stage, parent_id, urgent, author, created_at";

    #[async_trait]
    impl MessageRepo for PgRepo {
        async fn list_messages(&self, case_id: Id) -> RepoResult<Vec<Message>> {
            let sql = format!("SELECT {MESSAGE_COLS} FROM messages WHERE case_id = $1 ORDER BY created_at, id");
            Ok(sqlx::query_as::<_, Message>(&sql).bind(case_id).fetch_all(&self.pool).await?)
        }
        async fn get_message(&self, id: Id) -> RepoResult<Message> {
            let sql = format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = $1");
            Ok(sqlx::query_as::<_, Message>(&sql).bind(id).fetch_one(&self.pool).await?)
        }
        async fn create_message(&self, case_id: Id, new: NewMessage) -> RepoResult<Message> {
            let sql = format!(
                "INSERT INTO messages (case_id, body, stage, parent_id, urgent, author) VALUES ($1,$2,$3,$4,$5,$6) RETURNING {MESSAGE_COLS}"
            );
            let rec = sqlx::query_as::<_, Message>(&sql)
                .bind(case_id)
                .bind(&new.body)
                .bind(new.stage.as_ref())
                .bind(new.parent_id)
                .bind(new.urgent)
                .bind(&new.author)
                .fetch_one(&self.pool).await?;
            Ok(rec)
        }
    }
}
