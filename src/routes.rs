use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::NaiveDate;
use futures_util::TryStreamExt as _;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::due_process::DueProcessView;
use crate::error::ApiError;
use crate::models::*;
use crate::service::{CaseAlert, CaseService, EvidenceUrl, Upload, MAX_EVIDENCE_BYTES};
use crate::stats::{CaseStats, StatsRange};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/cases")
                    .route(web::get().to(list_cases))
                    .route(web::post().to(create_case)),
            )
            .service(web::resource("/cases/{id}").route(web::get().to(get_case)))
            .service(web::resource("/cases/{id}/close").route(web::post().to(close_case)))
            .service(web::resource("/cases/{id}/due-process/start").route(web::post().to(start_due_process)))
            .service(web::resource("/cases/{id}/due-process").route(web::get().to(due_process)))
            .service(
                web::resource("/cases/{id}/followups")
                    .route(web::get().to(list_followups))
                    .route(web::post().to(create_followup)),
            )
            .service(web::resource("/followups/{id}").route(web::patch().to(update_followup)))
            .service(
                web::resource("/followups/{id}/evidence")
                    .route(web::get().to(list_followup_evidence))
                    .route(web::post().to(upload_followup_evidence)),
            )
            .service(
                web::resource("/cases/{id}/messages")
                    .route(web::get().to(list_messages))
                    .route(web::post().to(post_message)),
            )
            .service(
                web::resource("/messages/{id}/attachments")
                    .route(web::get().to(list_message_attachments))
                    .route(web::post().to(upload_message_attachment)),
            )
            .service(web::resource("/evidence/{id}/url").route(web::get().to(evidence_url)))
            .service(web::resource("/alerts").route(web::get().to(alerts)))
            .service(web::resource("/config/stages").route(web::get().to(stage_config)))
            .service(web::resource("/config/action-types").route(web::get().to(action_types)))
            .service(web::resource("/stats").route(web::get().to(stats))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub service: CaseService,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CaseListQuery {
    /// Accepts the API names as well as the backend's Spanish labels.
    pub status: Option<String>,
    pub course: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct StartDueProcessRequest {
    /// Investigation budget in days; the server default applies when omitted.
    pub due_days: Option<i64>,
}

/// Multipart body of evidence uploads.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct EvidenceUpload {
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[utoipa::path(
    get,
    path = "/api/v1/cases",
    params(CaseListQuery),
    responses(
        (status = 200, description = "Cases, newest first", body = [Case]),
        (status = 400, description = "Unknown status")
    )
)]
pub async fn list_cases(data: web::Data<AppState>, query: web::Query<CaseListQuery>) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(CaseStatus::normalize(raw).ok_or_else(|| ApiError::BadRequest(format!("unknown status '{raw}'")))?),
        None => None,
    };
    let course = q.course.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    let cases = data.service.list_cases(CaseFilter { status, course }).await?;
    Ok(HttpResponse::Ok().json(cases))
}

#[utoipa::path(
    post,
    path = "/api/v1/cases",
    request_body = NewCase,
    responses(
        (status = 201, description = "Case reported", body = Case),
        (status = 400, description = "Missing required field")
    )
)]
pub async fn create_case(data: web::Data<AppState>, payload: web::Json<NewCase>) -> Result<HttpResponse, ApiError> {
    let case = data.service.create_case(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(case))
}

#[utoipa::path(
    get,
    path = "/api/v1/cases/{id}",
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 200, description = "Case", body = Case),
        (status = 404, description = "Case not found")
    )
)]
pub async fn get_case(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let case = data.service.get_case(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(case))
}

#[utoipa::path(
    post,
    path = "/api/v1/cases/{id}/close",
    request_body = Closure,
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 200, description = "Case closed", body = Case),
        (status = 400, description = "Already closed or missing resolution"),
        (status = 404, description = "Case not found")
    )
)]
pub async fn close_case(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<Closure>,
) -> Result<HttpResponse, ApiError> {
    let case = data.service.close_case(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(case))
}

#[utoipa::path(
    post,
    path = "/api/v1/cases/{id}/due-process/start",
    request_body = StartDueProcessRequest,
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 200, description = "Due process started (or already running)", body = Case),
        (status = 404, description = "Case not found"),
        (status = 409, description = "Case is closed")
    )
)]
pub async fn start_due_process(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Option<web::Json<StartDueProcessRequest>>,
) -> Result<HttpResponse, ApiError> {
    let due_days = payload.and_then(|p| p.into_inner().due_days);
    let case = data.service.start_due_process(path.into_inner(), due_days).await?;
    Ok(HttpResponse::Ok().json(case))
}

#[utoipa::path(
    get,
    path = "/api/v1/cases/{id}/due-process",
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 200, description = "Stage progress and deadline", body = DueProcessView),
        (status = 404, description = "Case not found")
    )
)]
pub async fn due_process(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let view = data.service.due_process_view(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[utoipa::path(
    get,
    path = "/api/v1/cases/{id}/followups",
    params(("id" = Id, Path, description = "Case id")),
    responses((status = 200, description = "Followups ordered by action date", body = [Followup]))
)]
pub async fn list_followups(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let items = data.service.list_followups(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(items))
}

#[utoipa::path(
    post,
    path = "/api/v1/cases/{id}/followups",
    request_body = NewFollowup,
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 201, description = "Followup recorded", body = Followup),
        (status = 400, description = "Missing field or case closed"),
        (status = 404, description = "Case not found")
    )
)]
pub async fn create_followup(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewFollowup>,
) -> Result<HttpResponse, ApiError> {
    let followup = data.service.add_followup(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(followup))
}

#[utoipa::path(
    patch,
    path = "/api/v1/followups/{id}",
    request_body = UpdateFollowup,
    params(("id" = Id, Path, description = "Followup id")),
    responses(
        (status = 200, description = "Followup updated", body = Followup),
        (status = 404, description = "Followup not found")
    )
)]
pub async fn update_followup(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateFollowup>,
) -> Result<HttpResponse, ApiError> {
    let followup = data.service.update_followup(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(followup))
}

/// Reads the `file` part of a multipart body.
async fn read_upload(mut payload: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::BadRequest("malformed multipart body".into())
    })? {
        let disposition = field.content_disposition();
        if disposition.get_name() != Some("file") {
            continue;
        }
        let file_name = disposition.get_filename().unwrap_or_default().to_string();
        let content_type = field.content_type().map(|m| m.to_string());
        let mut bytes: Vec<u8> = Vec::new();
        let mut field_stream = field;
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::BadRequest("upload interrupted".into())
        })? {
            if bytes.len() + chunk.len() > MAX_EVIDENCE_BYTES {
                return Err(ApiError::PayloadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        return Ok(Upload { file_name, content_type, bytes });
    }
    Err(ApiError::BadRequest("missing 'file' part".into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/followups/{id}/evidence",
    params(("id" = Id, Path, description = "Followup id")),
    request_body(content = EvidenceUpload, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Evidence stored", body = EvidenceFile),
        (status = 404, description = "Followup not found"),
        (status = 413, description = "Payload too large")
    )
)]
pub async fn upload_followup_evidence(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(payload).await?;
    let file = data.service.attach_to_followup(path.into_inner(), upload).await?;
    Ok(HttpResponse::Created().json(file))
}

#[utoipa::path(
    get,
    path = "/api/v1/followups/{id}/evidence",
    params(("id" = Id, Path, description = "Followup id")),
    responses((status = 200, description = "Evidence metadata", body = [EvidenceFile]))
)]
pub async fn list_followup_evidence(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let files = data.service.list_followup_evidence(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(files))
}

#[utoipa::path(
    get,
    path = "/api/v1/cases/{id}/messages",
    params(("id" = Id, Path, description = "Case id")),
    responses((status = 200, description = "Case messages, oldest first", body = [Message]))
)]
pub async fn list_messages(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let msgs = data.service.list_messages(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(msgs))
}

#[utoipa::path(
    post,
    path = "/api/v1/cases/{id}/messages",
    request_body = NewMessage,
    params(("id" = Id, Path, description = "Case id")),
    responses(
        (status = 201, description = "Message posted", body = Message),
        (status = 400, description = "Invalid message or reply target"),
        (status = 404, description = "Case or parent not found")
    )
)]
pub async fn post_message(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewMessage>,
) -> Result<HttpResponse, ApiError> {
    let msg = data.service.post_message(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(msg))
}

#[utoipa::path(
    post,
    path = "/api/v1/messages/{id}/attachments",
    params(("id" = Id, Path, description = "Message id")),
    request_body(content = EvidenceUpload, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Attachment stored", body = EvidenceFile),
        (status = 404, description = "Message not found"),
        (status = 413, description = "Payload too large")
    )
)]
pub async fn upload_message_attachment(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(payload).await?;
    let file = data.service.attach_to_message(path.into_inner(), upload).await?;
    Ok(HttpResponse::Created().json(file))
}

#[utoipa::path(
    get,
    path = "/api/v1/messages/{id}/attachments",
    params(("id" = Id, Path, description = "Message id")),
    responses((status = 200, description = "Attachment metadata", body = [EvidenceFile]))
)]
pub async fn list_message_attachments(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let files = data.service.list_message_evidence(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(files))
}

#[utoipa::path(
    get,
    path = "/api/v1/evidence/{id}/url",
    params(("id" = Id, Path, description = "Evidence id")),
    responses(
        (status = 200, description = "Retrievable URL", body = EvidenceUrl),
        (status = 404, description = "Evidence not found")
    )
)]
pub async fn evidence_url(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let url = data.service.evidence_url(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(url))
}

#[utoipa::path(
    get,
    path = "/api/v1/alerts",
    responses((status = 200, description = "Open cases needing attention, most urgent first", body = [CaseAlert]))
)]
pub async fn alerts(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let alerts = data.service.alerts().await?;
    Ok(HttpResponse::Ok().json(alerts))
}

#[utoipa::path(
    get,
    path = "/api/v1/config/stages",
    responses((status = 200, description = "Ordered stages with day budgets", body = [StageSla]))
)]
pub async fn stage_config(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.service.stage_config().await)
}

#[utoipa::path(
    get,
    path = "/api/v1/config/action-types",
    responses((status = 200, description = "Action-type catalog", body = [String]))
)]
pub async fn action_types(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.service.action_types().await)
}

#[utoipa::path(
    get,
    path = "/api/v1/stats",
    params(StatsQuery),
    responses((status = 200, description = "Aggregates over the incident-date window", body = CaseStats))
)]
pub async fn stats(data: web::Data<AppState>, query: web::Query<StatsQuery>) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    if let (Some(from), Some(to)) = (q.from, q.to) {
        if from > to {
            return Err(ApiError::BadRequest("'from' is after 'to'".into()));
        }
    }
    let stats = data.service.stats(StatsRange { from: q.from, to: q.to }).await?;
    Ok(HttpResponse::Ok().json(stats))
}
