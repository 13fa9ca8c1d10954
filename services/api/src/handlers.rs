//! HTTP surface: schedule management, call history, and the call-instruction
//! markup endpoint the telephony provider fetches when a call is answered.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{
    CallRecord, CallRecordDetail, ErrorResponse, ScheduleCallPayload, ScheduledCall,
};
use crate::state::AppState;

/// Focus the agent falls back to when a schedule carries no custom prompt.
const DEFAULT_PROMPT: &str =
    "You are a caring wellness companion checking in on how the person is feeling today.";
const DEFAULT_FIRST_MESSAGE: &str =
    "Hi! This is your scheduled wellness check-in. How are you feeling today?";

/// Error type for API handlers, mapped onto HTTP status codes.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(e) => {
                error!(error = ?e, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError::InternalServerError(err.into())
    }
}

/// Caller identity comes from the authenticating proxy in front of this
/// service.
fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("missing x-user-id header".to_string()))
}

#[utoipa::path(
    post,
    path = "/calls/schedules",
    request_body = ScheduleCallPayload,
    responses(
        (status = 201, description = "Call scheduled", body = ScheduledCall),
        (status = 400, description = "Invalid number or time", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn schedule_call(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ScheduleCallPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    if payload.scheduled_time <= Utc::now() {
        return Err(ApiError::BadRequest(
            "scheduled_time must be in the future".to_string(),
        ));
    }

    let number = state
        .telephony
        .validate_number(&payload.phone_number)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let schedule = state
        .db
        .create_schedule(
            &user_id,
            &number,
            payload.scheduled_time,
            payload.custom_prompt.as_deref(),
            payload.first_message.as_deref(),
        )
        .await?;

    info!(schedule_id = %schedule.id, %user_id, "Call scheduled");
    Ok((StatusCode::CREATED, Json(schedule)))
}

#[utoipa::path(
    get,
    path = "/calls/schedules",
    responses(
        (status = 200, description = "The caller's schedules", body = [ScheduledCall])
    ),
    tag = "schedules"
)]
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ScheduledCall>>, ApiError> {
    let user_id = user_id(&headers)?;
    let schedules = state.db.list_schedules(&user_id).await?;
    Ok(Json(schedules))
}

#[utoipa::path(
    post,
    path = "/calls/schedules/{id}/cancel",
    params(("id" = Uuid, Path, description = "Schedule id")),
    responses(
        (status = 200, description = "Schedule cancelled"),
        (status = 404, description = "Not found or no longer pending", body = ErrorResponse)
    ),
    tag = "schedules"
)]
pub async fn cancel_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    if state.db.cancel_schedule(id, &user_id).await? {
        info!(schedule_id = %id, "Schedule cancelled");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(
            "schedule not found or no longer pending".to_string(),
        ))
    }
}

#[utoipa::path(
    get,
    path = "/calls/history",
    responses(
        (status = 200, description = "The caller's call records", body = [CallRecord])
    ),
    tag = "history"
)]
pub async fn call_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let user_id = user_id(&headers)?;
    let records = state.db.list_call_records(&user_id).await?;
    Ok(Json(records))
}

#[utoipa::path(
    get,
    path = "/calls/history/{id}",
    params(("id" = Uuid, Path, description = "Call record id")),
    responses(
        (status = 200, description = "Call record with sentiment", body = CallRecordDetail),
        (status = 404, description = "No such record", body = ErrorResponse)
    ),
    tag = "history"
)]
pub async fn call_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CallRecordDetail>, ApiError> {
    let user_id = user_id(&headers)?;
    let record = state
        .db
        .get_call_record(id, &user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("call record not found".to_string()))?;
    let sentiment = state.db.get_sentiment(record.id).await?;
    Ok(Json(CallRecordDetail { record, sentiment }))
}

/// Serves the call-instruction markup the telephony provider fetches when the
/// outbound call is answered. Points the media stream back at this service
/// and forwards the schedule's prompt/greeting as stream parameters.
pub async fn call_instructions(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<Uuid>,
) -> Response {
    let twiml = match state.db.get_schedule(schedule_id).await {
        Ok(schedule) => {
            match &schedule {
                Some(found) if !found.status.is_terminal() => {
                    info!(%schedule_id, "Serving call instructions");
                }
                Some(found) => {
                    warn!(%schedule_id, status = %found.status, "Instructions requested for settled schedule");
                }
                None => warn!(%schedule_id, "Instructions requested for unknown schedule"),
            }
            render_instructions(schedule.as_ref(), &state.config.stream_url(schedule_id))
        }
        Err(e) => {
            error!(%schedule_id, error = %e, "Schedule lookup failed");
            render_rejection_twiml()
        }
    };

    ([(header::CONTENT_TYPE, "text/xml")], twiml).into_response()
}

/// A cancelled or already-settled schedule gets the hangup document; the
/// stream document only goes out while the call is actually being placed.
fn render_instructions(schedule: Option<&ScheduledCall>, stream_url: &str) -> String {
    match schedule {
        Some(schedule) if !schedule.status.is_terminal() => render_stream_twiml(
            stream_url,
            schedule.custom_prompt.as_deref().unwrap_or(DEFAULT_PROMPT),
            schedule
                .first_message
                .as_deref()
                .unwrap_or(DEFAULT_FIRST_MESSAGE),
        ),
        _ => render_rejection_twiml(),
    }
}

fn render_stream_twiml(stream_url: &str, prompt: &str, first_message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{}">
            <Parameter name="prompt" value="{}" />
            <Parameter name="first_message" value="{}" />
        </Stream>
    </Connect>
</Response>"#,
        escape_xml(stream_url),
        escape_xml(prompt),
        escape_xml(first_message)
    )
}

fn render_rejection_twiml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>Sorry, this call is no longer available. Goodbye.</Say>
    <Hangup/>
</Response>"#
        .to_string()
}

/// Escapes the five XML-significant characters for attribute values.
fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
