use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::cache::{DataChanged, EventBus, QueryCache, Topic};
use crate::due_process::{
    build_view, normalize_stage_label, sla_for, stage_sla_map, stages_or_default, DeadlineView,
    DueProcessView, UrgencyLevel, DEFAULT_ACTION_TYPES,
};
use crate::models::*;
use crate::repo::{Repo, RepoError};
use crate::retry::{with_retry, with_retry_envelope, RetryPolicy, TransientError};
use crate::stats::{self, CaseStats, StatsRange};
use crate::storage::{EvidenceStore, StorageError};

pub const MAX_EVIDENCE_BYTES: usize = 20 * 1024 * 1024;

/// Upper bound for an investigation budget.
pub const MAX_INVESTIGATION_DAYS: i64 = 365;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("file exceeds {0} bytes")]
    TooLarge(usize),
    /// The backend answered but refused the operation.
    #[error("{}", .0.message)]
    Rejected(BackendError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

fn require(field: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::Invalid(format!("{field} is required")));
    }
    Ok(())
}

fn require_id(field: &str, id: Id) -> ServiceResult<()> {
    if id <= 0 {
        return Err(ServiceError::Invalid(format!("{field} must be a positive id")));
    }
    Ok(())
}

/// A file received from a client, not yet stored.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CaseAlert {
    pub case: Case,
    pub deadline: DeadlineView,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EvidenceUrl {
    pub id: Id,
    pub url: String,
}

/// Case workflow on top of the hosted backend.
///
/// Every remote call goes through the retry policy; reads are served from the
/// query cache when fresh, and every successful mutation publishes a
/// [`DataChanged`] event.
#[derive(Clone)]
pub struct CaseService {
    repo: Arc<dyn Repo>,
    store: Arc<dyn EvidenceStore>,
    cache: QueryCache,
    bus: EventBus,
    retry: RetryPolicy,
    default_investigation_days: i64,
}

impl CaseService {
    pub fn new(
        repo: Arc<dyn Repo>,
        store: Arc<dyn EvidenceStore>,
        cache: QueryCache,
        bus: EventBus,
        retry: RetryPolicy,
        default_investigation_days: i64,
    ) -> Self {
        Self { repo, store, cache, bus, retry, default_investigation_days }
    }

    pub fn bus(&self) -> &EventBus { &self.bus }

    pub fn cache(&self) -> &QueryCache { &self.cache }

    async fn call<T, E, F, Fut>(&self, op: &'static str, f: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError + std::fmt::Display,
        ServiceError: From<E>,
    {
        match with_retry(&self.retry, f).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(op, error = %e, "remote call failed");
                Err(e.into())
            }
        }
    }

    async fn cached<T, F, Fut>(&self, op: &'static str, key: &str, f: F) -> ServiceResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        if let Some(hit) = self.cache.get::<T>(key) {
            return Ok(hit);
        }
        let fresh = self.call(op, f).await?;
        self.cache.set(key, &fresh);
        Ok(fresh)
    }

    fn changed(&self, topic: Topic, case_id: Option<Id>) {
        let event = DataChanged { topic, case_id };
        self.cache.apply(&event);
        self.bus.publish(event);
    }

    // ---------------- cases ----------------

    pub async fn list_cases(&self, filter: CaseFilter) -> ServiceResult<Vec<Case>> {
        self.cached("list_cases", &filter.cache_key(), || self.repo.list_cases(&filter)).await
    }

    pub async fn get_case(&self, id: Id) -> ServiceResult<Case> {
        require_id("case id", id)?;
        self.cached("get_case", &format!("cases:{id}"), || self.repo.get_case(id)).await
    }

    /// Uncached read, for decisions that must see the latest state.
    async fn fresh_case(&self, id: Id) -> ServiceResult<Case> {
        self.call("get_case", || self.repo.get_case(id)).await
    }

    pub async fn create_case(&self, mut new: NewCase) -> ServiceResult<Case> {
        require("course", &new.course)?;
        require("conduct_type", &new.conduct_type)?;
        require("description", &new.description)?;
        require("responsible_name", &new.responsible_name)?;
        new.course = new.course.trim().to_string();
        new.conduct_type = new.conduct_type.trim().to_string();
        new.conduct_category = new.conduct_category.trim().to_string();
        new.responsible_name = new.responsible_name.trim().to_string();
        new.student = new.student.filter(|s| !s.name.trim().is_empty());

        let case = self.call("create_case", || self.repo.create_case(new.clone())).await?;
        info!(case_id = case.id, "case reported");
        self.changed(Topic::Cases, Some(case.id));
        Ok(case)
    }

    pub async fn close_case(&self, id: Id, closure: Closure) -> ServiceResult<Case> {
        require_id("case id", id)?;
        require("resolution", &closure.resolution)?;
        require("closed_by_name", &closure.closed_by_name)?;
        let current = self.fresh_case(id).await?;
        if current.is_closed() {
            return Err(ServiceError::Invalid("case is already closed".into()));
        }
        let case = self.call("close_case", || self.repo.close_case(id, closure.clone())).await?;
        info!(case_id = id, "case closed");
        self.changed(Topic::Cases, Some(id));
        Ok(case)
    }

    pub async fn start_due_process(&self, id: Id, due_days: Option<i64>) -> ServiceResult<Case> {
        require_id("case id", id)?;
        let days = due_days.unwrap_or(self.default_investigation_days);
        if days <= 0 {
            return Err(ServiceError::Invalid("due_days must be positive".into()));
        }
        if days > MAX_INVESTIGATION_DAYS {
            return Err(ServiceError::Invalid(format!("due_days must not exceed {MAX_INVESTIGATION_DAYS}")));
        }
        let reply = with_retry_envelope(&self.retry, || self.repo.start_due_process(id, days))
            .await
            .map_err(|e| {
                warn!(op = "start_due_process", error = %e, "remote call failed");
                e
            })?;
        match reply {
            Envelope { error: Some(err), .. } => {
                warn!(case_id = id, code = ?err.code, message = %err.message, "due process start rejected");
                Err(ServiceError::Rejected(err))
            }
            Envelope { data: Some(case), .. } => {
                info!(case_id = id, due = ?case.investigation_due_date, "due process started");
                self.changed(Topic::Cases, Some(id));
                Ok(case)
            }
            Envelope { data: None, error: None } => Err(RepoError::NotFound.into()),
        }
    }

    // ---------------- followups ----------------

    pub async fn list_followups(&self, case_id: Id) -> ServiceResult<Vec<Followup>> {
        require_id("case id", case_id)?;
        self.cached("list_followups", &format!("followups:{case_id}"), || self.repo.list_followups(case_id))
            .await
    }

    pub async fn add_followup(&self, case_id: Id, mut new: NewFollowup) -> ServiceResult<Followup> {
        require_id("case id", case_id)?;
        require("action_type", &new.action_type)?;
        require("process_stage", &new.process_stage)?;
        require("responsible", &new.responsible)?;
        new.process_stage = normalize_stage_label(&new.process_stage);
        new.action_type = new.action_type.trim().to_string();
        new.responsible = new.responsible.trim().to_string();

        let case = self.fresh_case(case_id).await?;
        if case.is_closed() {
            return Err(ServiceError::Invalid("case is closed".into()));
        }
        let followup = self.call("create_followup", || self.repo.create_followup(case_id, new.clone())).await?;
        self.changed(Topic::Followups, Some(case_id));
        Ok(followup)
    }

    pub async fn update_followup(&self, id: Id, upd: UpdateFollowup) -> ServiceResult<Followup> {
        require_id("followup id", id)?;
        if upd.is_empty() {
            return Err(ServiceError::Invalid("nothing to update".into()));
        }
        if let Some(r) = &upd.responsible {
            require("responsible", r)?;
        }
        let followup = self.call("update_followup", || self.repo.update_followup(id, upd.clone())).await?;
        self.changed(Topic::Followups, Some(followup.case_id));
        Ok(followup)
    }

    // ---------------- configuration ----------------

    /// Configured stages with their day budgets, or the defaults when the
    /// configuration is empty or cannot be fetched.
    pub async fn stage_config(&self) -> Vec<StageSla> {
        let rows = match self.cached("stage_sla", "config:stages", || self.repo.stage_sla()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "stage configuration unavailable, using defaults");
                Vec::new()
            }
        };
        let labels: Vec<&str> = rows.iter().map(|r| r.stage.as_str()).collect();
        let sla = stage_sla_map(&rows);
        stages_or_default(&labels)
            .into_iter()
            .map(|stage| StageSla { days: sla_for(&sla, &stage), stage })
            .collect()
    }

    pub async fn action_types(&self) -> Vec<String> {
        let remote = match self.cached("action_types", "config:action-types", || self.repo.action_types()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "action-type catalog unavailable, using defaults");
                Vec::new()
            }
        };
        let mut types: Vec<String> = Vec::new();
        for t in remote.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !types.iter().any(|x| x == t) {
                types.push(t.to_string());
            }
        }
        if types.is_empty() {
            types = DEFAULT_ACTION_TYPES.iter().map(|s| s.to_string()).collect();
        }
        types
    }

    // ---------------- deadlines & due process ----------------

    pub async fn deadline_summaries(&self) -> ServiceResult<Vec<DeadlineSummary>> {
        self.cached("deadline_summaries", "deadlines:all", || self.repo.deadline_summaries()).await
    }

    async fn deadline_for(&self, case_id: Id) -> ServiceResult<Option<DeadlineSummary>> {
        self.cached("deadline_summary", &format!("deadlines:{case_id}"), || self.repo.deadline_summary(case_id))
            .await
    }

    pub async fn due_process_view(&self, case_id: Id) -> ServiceResult<DueProcessView> {
        require_id("case id", case_id)?;
        let (joined, sla_rows) = futures_util::join!(
            async {
                futures_util::try_join!(
                    self.get_case(case_id),
                    self.list_followups(case_id),
                    self.deadline_for(case_id),
                )
            },
            self.stage_config(),
        );
        let (case, followups, summary) = joined?;
        let labels: Vec<&str> = sla_rows.iter().map(|r| r.stage.as_str()).collect();
        let days_remaining = summary.and_then(|s| s.days_remaining);
        Ok(build_view(&case, &labels, &sla_rows, &followups, days_remaining))
    }

    /// Open cases that are overdue, due today or due soon, most urgent first.
    pub async fn alerts(&self) -> ServiceResult<Vec<CaseAlert>> {
        let (cases, deadlines) =
            futures_util::try_join!(self.list_cases(CaseFilter::default()), self.deadline_summaries())?;
        let by_case: HashMap<Id, DeadlineSummary> = deadlines.into_iter().map(|d| (d.case_id, d)).collect();

        let mut alerts: Vec<(UrgencyLevel, CaseAlert)> = cases
            .into_iter()
            .filter(|c| !c.is_closed())
            .filter_map(|case| {
                let d = by_case.get(&case.id)?;
                if !d.urgency.is_alert() {
                    return None;
                }
                Some((d.urgency, CaseAlert { case, deadline: DeadlineView::from_summary(d) }))
            })
            .collect();
        alerts.sort_by_key(|(level, a)| (level.rank(), a.deadline.days_remaining.unwrap_or(i64::MAX), a.case.id));
        Ok(alerts.into_iter().map(|(_, a)| a).collect())
    }

    pub async fn stats(&self, range: StatsRange) -> ServiceResult<CaseStats> {
        let (cases, deadlines) =
            futures_util::try_join!(self.list_cases(CaseFilter::default()), self.deadline_summaries())?;
        Ok(stats::compute(&cases, &deadlines, &range))
    }

    // ---------------- messages ----------------

    pub async fn list_messages(&self, case_id: Id) -> ServiceResult<Vec<Message>> {
        require_id("case id", case_id)?;
        self.cached("list_messages", &format!("messages:{case_id}"), || self.repo.list_messages(case_id)).await
    }

    pub async fn post_message(&self, case_id: Id, mut new: NewMessage) -> ServiceResult<Message> {
        require_id("case id", case_id)?;
        require("body", &new.body)?;
        require("author", &new.author)?;
        new.stage = new.stage.map(|s| normalize_stage_label(&s)).filter(|s| !s.is_empty());

        if let Some(parent_id) = new.parent_id {
            require_id("parent_id", parent_id)?;
            let parent = self.call("get_message", || self.repo.get_message(parent_id)).await?;
            if parent.case_id != case_id {
                return Err(ServiceError::Invalid("parent message belongs to another case".into()));
            }
            if parent.parent_id.is_some() {
                return Err(ServiceError::Invalid("replies cannot be nested".into()));
            }
        }
        let msg = self.call("create_message", || self.repo.create_message(case_id, new.clone())).await?;
        self.changed(Topic::Messages, Some(case_id));
        Ok(msg)
    }

    // ---------------- evidence ----------------

    fn check_upload(upload: &Upload) -> ServiceResult<()> {
        if upload.bytes.is_empty() {
            return Err(ServiceError::Invalid("file is empty".into()));
        }
        if upload.bytes.len() > MAX_EVIDENCE_BYTES {
            return Err(ServiceError::TooLarge(MAX_EVIDENCE_BYTES));
        }
        Ok(())
    }

    pub async fn attach_to_followup(&self, followup_id: Id, upload: Upload) -> ServiceResult<EvidenceFile> {
        require_id("followup id", followup_id)?;
        Self::check_upload(&upload)?;
        let followup = self.call("get_followup", || self.repo.get_followup(followup_id)).await?;
        self.store_evidence(followup.case_id, Some(followup_id), None, upload).await
    }

    pub async fn attach_to_message(&self, message_id: Id, upload: Upload) -> ServiceResult<EvidenceFile> {
        require_id("message id", message_id)?;
        Self::check_upload(&upload)?;
        let message = self.call("get_message", || self.repo.get_message(message_id)).await?;
        self.store_evidence(message.case_id, None, Some(message_id), upload).await
    }

    async fn store_evidence(
        &self,
        case_id: Id,
        followup_id: Option<Id>,
        message_id: Option<Id>,
        upload: Upload,
    ) -> ServiceResult<EvidenceFile> {
        let hash = format!("{:x}", Sha256::digest(&upload.bytes));
        let key = format!("evidence/{case_id}/{hash}");
        let content_type = infer::get(&upload.bytes)
            .map(|t| t.mime_type().to_string())
            .or(upload.content_type.clone().filter(|c| !c.trim().is_empty()))
            .unwrap_or_else(|| "application/octet-stream".into());
        let file_name = upload
            .file_name
            .rsplit(['/', '\\'])
            .next()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("archivo")
            .to_string();

        self.call("put_evidence", || self.store.put(&key, &content_type, &upload.bytes)).await?;
        let new = NewEvidence {
            followup_id,
            message_id,
            storage_path: key.clone(),
            file_name,
            content_type: content_type.clone(),
            size: upload.bytes.len() as i64,
        };
        let file = self.call("create_evidence", || self.repo.create_evidence(new.clone())).await?;
        info!(case_id, evidence_id = file.id, size = file.size, "evidence stored");
        self.changed(Topic::Evidence, Some(case_id));
        Ok(file)
    }

    pub async fn list_followup_evidence(&self, followup_id: Id) -> ServiceResult<Vec<EvidenceFile>> {
        require_id("followup id", followup_id)?;
        self.cached("list_followup_evidence", &format!("evidence:followup:{followup_id}"), || {
            self.repo.list_followup_evidence(followup_id)
        })
        .await
    }

    pub async fn list_message_evidence(&self, message_id: Id) -> ServiceResult<Vec<EvidenceFile>> {
        require_id("message id", message_id)?;
        self.cached("list_message_evidence", &format!("evidence:message:{message_id}"), || {
            self.repo.list_message_evidence(message_id)
        })
        .await
    }

    pub async fn evidence_url(&self, id: Id) -> ServiceResult<EvidenceUrl> {
        require_id("evidence id", id)?;
        let file = self.call("get_evidence", || self.repo.get_evidence(id)).await?;
        let url = self.call("evidence_url", || self.store.url(&file.storage_path)).await?;
        Ok(EvidenceUrl { id, url })
    }
}
