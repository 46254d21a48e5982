use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::due_process::UrgencyLevel;
use crate::retry::TransientError;

pub type Id = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CaseStatus {
    Reported,
    InFollowUp,
    Closed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Reported => "reported",
            CaseStatus::InFollowUp => "in-follow-up",
            CaseStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Student {
    pub name: String,
    pub national_id: Option<String>,
}

/// Closure metadata, also the body of a close request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Closure {
    pub resolution: String,
    pub measure: Option<String>,
    pub closed_by_name: String,
    pub closed_by_role: Option<String>,
}

/// A disciplinary incident. `status` is `Closed` exactly when `closed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Case {
    pub id: Id,
    pub incident_at: DateTime<Utc>,
    pub course: String,
    pub conduct_type: String,
    pub conduct_category: String,
    pub description: String,
    pub status: CaseStatus,
    pub responsible_name: String,
    pub responsible_role: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closure: Option<Closure>,
    pub followup_started_at: Option<DateTime<Utc>>,
    pub investigation_due_date: Option<NaiveDate>,
    pub student: Option<Student>,
}

impl Case {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Due-process tracking applies once follow-up has started.
    pub fn is_tracked(&self) -> bool {
        self.followup_started_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCase {
    pub incident_at: DateTime<Utc>,
    pub course: String,
    pub conduct_type: String,
    #[serde(default)]
    pub conduct_category: String,
    pub description: String,
    pub responsible_name: String,
    #[serde(default)]
    pub responsible_role: Option<String>,
    #[serde(default)]
    pub student: Option<Student>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseFilter {
    pub status: Option<CaseStatus>,
    pub course: Option<String>,
}

impl CaseFilter {
    pub fn matches(&self, case: &Case) -> bool {
        self.status.map(|s| s == case.status).unwrap_or(true)
            && self.course.as_ref().map(|c| c == &case.course).unwrap_or(true)
    }

    pub fn cache_key(&self) -> String {
        format!(
            "cases:list:{}:{}",
            self.status.map(|s| s.as_str()).unwrap_or("*"),
            self.course.as_deref().unwrap_or("*")
        )
    }
}

/// One recorded action in a case's due-process timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Followup {
    pub id: Id,
    pub case_id: Id,
    pub action_date: NaiveDate,
    pub action_type: String,
    pub process_stage: String,
    pub detail: String,
    pub responsible: String,
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewFollowup {
    pub action_date: NaiveDate,
    pub action_type: String,
    pub process_stage: String,
    #[serde(default)]
    pub detail: String,
    pub responsible: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

/// The only followup fields that may change after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateFollowup {
    pub detail: Option<String>,
    pub responsible: Option<String>,
    pub due_date: Option<NaiveDate>,
}

impl UpdateFollowup {
    pub fn is_empty(&self) -> bool {
        self.detail.is_none() && self.responsible.is_none() && self.due_date.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct StageSla {
    pub stage: String,
    pub days: Option<i32>,
}

/// Per-case deadline summary as computed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeadlineSummary {
    pub case_id: Id,
    pub days_remaining: Option<i64>,
    pub urgency: UrgencyLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct EvidenceFile {
    pub id: Id,
    pub followup_id: Option<Id>,
    pub message_id: Option<Id>,
    pub storage_path: String,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvidence {
    pub followup_id: Option<Id>,
    pub message_id: Option<Id>,
    pub storage_path: String,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Message {
    pub id: Id,
    pub case_id: Id,
    pub body: String,
    pub stage: Option<String>,
    pub parent_id: Option<Id>,
    pub urgent: bool,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewMessage {
    pub body: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Id>,
    #[serde(default)]
    pub urgent: bool,
    pub author: String,
}

/// Application-level error embedded in an otherwise successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BackendError {
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl TransientError for BackendError {
    fn code(&self) -> Option<&str> { self.code.as_deref() }
    fn message(&self) -> String { self.message.clone() }
    fn timed_out(after: std::time::Duration) -> Self {
        BackendError { code: Some("ETIMEDOUT".into()), message: format!("timeout after {}ms", after.as_millis()), details: None }
    }
}

/// The backend's `{data, error}` reply shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<BackendError>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self { Self { data: Some(data), error: None } }
    pub fn err(error: BackendError) -> Self { Self { data: None, error: Some(error) } }
}
