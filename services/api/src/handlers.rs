//! Axum handlers for the telephony webhooks and the REST API.
//!
//! The answer webhook is the entry point of every call: it creates the
//! session, registers it, and answers with a call-control document that
//! connects the call's media to our websocket. Everything else is
//! observability.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    call::session::spawn_session,
    models::{ActiveCallsResponse, CallRecord, ErrorResponse, StatusResponse},
    protocol::{AnswerParams, CallEventPayload, NccoAction},
    providers::build_provider_set,
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Answer webhook (GET variant; the platform default).
#[utoipa::path(
    get,
    path = "/webhooks/answer",
    params(
        ("uuid" = Option<String>, Query, description = "Call leg uuid"),
        ("conversation_uuid" = Option<String>, Query, description = "Conversation uuid"),
        ("from" = Option<String>, Query, description = "Caller number"),
        ("to" = Option<String>, Query, description = "Called number")
    ),
    responses(
        (status = 200, description = "Call-control document connecting the call to the media socket"),
        (status = 400, description = "Missing call uuid", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn answer_call_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnswerParams>,
) -> Result<Json<Vec<NccoAction>>, ApiError> {
    answer_call(state, params).await
}

/// Answer webhook (POST variant).
#[utoipa::path(
    post,
    path = "/webhooks/answer",
    request_body = AnswerParams,
    responses(
        (status = 200, description = "Call-control document connecting the call to the media socket"),
        (status = 400, description = "Missing call uuid", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn answer_call_post(
    State(state): State<Arc<AppState>>,
    Json(params): Json<AnswerParams>,
) -> Result<Json<Vec<NccoAction>>, ApiError> {
    answer_call(state, params).await
}

async fn answer_call(
    state: Arc<AppState>,
    params: AnswerParams,
) -> Result<Json<Vec<NccoAction>>, ApiError> {
    let call_id = params
        .call_id()
        .ok_or_else(|| ApiError::BadRequest("answer webhook carried no call uuid".to_string()))?
        .to_string();
    let caller = params.from.clone().unwrap_or_default();
    let called = params.to.clone().unwrap_or_default();
    info!(call_id, caller, "answering inbound call");

    // Call logging never blocks or fails the answer.
    {
        let db = state.db.clone();
        let call_id = call_id.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            if let Err(err) = db.log_call_start(&call_id, &caller, &called).await {
                warn!(call_id, error = %err, "failed to record call start");
            }
        });
    }

    let providers = Arc::new(build_provider_set(&state.config)?);
    let handle = spawn_session(
        state.registry.clone(),
        Some(Arc::new(state.db.clone())),
        providers,
        state.config.session_snapshot(),
        state.timeout_audio.clone(),
        call_id.clone(),
    )?;
    state.registry.register(handle).await;

    Ok(Json(vec![NccoAction::connect_to_socket(
        &state.config.public_host,
        &call_id,
        &caller,
    )]))
}

/// Call status webhook (POST variant). Terminal statuses tear the session
/// down.
#[utoipa::path(
    post,
    path = "/webhooks/events",
    request_body = CallEventPayload,
    responses(
        (status = 204, description = "Event accepted")
    )
)]
pub async fn call_events_post(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CallEventPayload>,
) -> StatusCode {
    call_events(state, payload).await
}

/// Call status webhook (GET variant).
#[utoipa::path(
    get,
    path = "/webhooks/events",
    params(
        ("uuid" = Option<String>, Query, description = "Call leg uuid"),
        ("status" = Option<String>, Query, description = "Call status")
    ),
    responses(
        (status = 204, description = "Event accepted")
    )
)]
pub async fn call_events_get(
    State(state): State<Arc<AppState>>,
    Query(payload): Query<CallEventPayload>,
) -> StatusCode {
    call_events(state, payload).await
}

async fn call_events(state: Arc<AppState>, payload: CallEventPayload) -> StatusCode {
    let status = payload.status.as_deref().unwrap_or("unknown");
    match payload.call_id() {
        Some(call_id) => {
            info!(call_id, status, "call status event");
            if payload.is_terminal() {
                state.registry.close_session(call_id).await;
            }
        }
        None => warn!(status, "call status event with no uuid"),
    }
    StatusCode::NO_CONTENT
}

/// Currently live calls.
#[utoipa::path(
    get,
    path = "/calls/active",
    responses(
        (status = 200, description = "Live call ids", body = ActiveCallsResponse)
    )
)]
pub async fn get_active_calls(State(state): State<Arc<AppState>>) -> Json<ActiveCallsResponse> {
    let call_ids = state.registry.active_ids().await;
    Json(ActiveCallsResponse {
        count: call_ids.len(),
        call_ids,
    })
}

#[derive(Debug, serde::Deserialize)]
pub struct CallsQuery {
    pub limit: Option<i64>,
}

/// Recent call records, newest first.
#[utoipa::path(
    get,
    path = "/calls",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum records to return (default 50)")
    ),
    responses(
        (status = 200, description = "Recent calls", body = [CallRecord]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_calls(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallsQuery>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let records = state.db.recent_calls(limit).await?;
    Ok(Json(records))
}

/// Liveness probe with a live-call count.
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Service status", body = StatusResponse)
    )
)]
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        active_calls: state.registry.active_count().await,
    })
}
