//! Route table and OpenAPI document.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers;
use crate::models;
use crate::state::AppState;
use crate::ws;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::schedule_call,
        handlers::list_schedules,
        handlers::cancel_schedule,
        handlers::call_history,
        handlers::call_detail,
    ),
    components(schemas(
        models::ScheduledCall,
        models::ScheduleStatus,
        models::ScheduleCallPayload,
        models::CallRecord,
        models::CallSentiment,
        models::CallRecordDetail,
        models::Transcript,
        models::ErrorResponse,
    )),
    tags(
        (name = "schedules", description = "Scheduling wellness check-in calls"),
        (name = "history", description = "Completed call records and sentiment")
    ),
    info(
        title = "wellcall",
        description = "Scheduled AI wellness check-in calls over the phone"
    )
)]
pub struct ApiDoc;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/calls/schedules",
            get(handlers::list_schedules).post(handlers::schedule_call),
        )
        .route(
            "/calls/schedules/{id}/cancel",
            post(handlers::cancel_schedule),
        )
        .route("/calls/history", get(handlers::call_history))
        .route("/calls/history/{id}", get(handlers::call_detail))
        // The telephony provider is configured to POST for instructions, but
        // GET is kept for manual inspection.
        .route(
            "/voice/twiml/{schedule_id}",
            get(handlers::call_instructions).post(handlers::call_instructions),
        )
        .route("/ws/media-stream/{schedule_id}", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}
