use crate::due_process::{DeadlineView, DueProcessView, StageView, UrgencyLevel};
use crate::error::ApiErrorBody;
use crate::models::{
    Case, CaseStatus, Closure, DeadlineSummary, EvidenceFile, Followup, Message, NewCase, NewFollowup, NewMessage,
    StageSla, Student, UpdateFollowup,
};
use crate::routes::{EvidenceUpload, StartDueProcessRequest};
use crate::service::{CaseAlert, EvidenceUrl};
use crate::stats::CaseStats;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_cases,
        crate::routes::create_case,
        crate::routes::get_case,
        crate::routes::close_case,
        crate::routes::start_due_process,
        crate::routes::due_process,
        crate::routes::list_followups,
        crate::routes::create_followup,
        crate::routes::update_followup,
        crate::routes::upload_followup_evidence,
        crate::routes::list_followup_evidence,
        crate::routes::list_messages,
        crate::routes::post_message,
        crate::routes::upload_message_attachment,
        crate::routes::list_message_attachments,
        crate::routes::evidence_url,
        crate::routes::alerts,
        crate::routes::stage_config,
        crate::routes::action_types,
        crate::routes::stats,
    ),
    components(schemas(
        Case, CaseStatus, Student, Closure, NewCase,
        Followup, NewFollowup, UpdateFollowup,
        Message, NewMessage, EvidenceFile, EvidenceUpload, EvidenceUrl,
        StageSla, DeadlineSummary, UrgencyLevel, DeadlineView, StageView, DueProcessView,
        CaseAlert, CaseStats, StartDueProcessRequest, ApiErrorBody
    )),
    tags(
        (name = "cases", description = "Case intake, closure and due process"),
        (name = "followups", description = "Due-process actions and evidence"),
        (name = "messages", description = "Case discussion threads"),
    )
)]
pub struct ApiDoc;
