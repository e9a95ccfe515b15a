//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application:
//! telephony webhooks, the per-call media websocket, the REST observability
//! endpoints, and OpenAPI documentation.

use crate::{
    call::relay,
    handlers,
    models::{ActiveCallsResponse, CallRecord, CallStatus, ErrorResponse, StatusResponse},
    protocol::{AnswerParams, CallEventPayload, NccoAction, WebsocketEndpoint},
    state::AppState,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::answer_call_get,
        handlers::answer_call_post,
        handlers::call_events_get,
        handlers::call_events_post,
        handlers::get_active_calls,
        handlers::get_calls,
        handlers::get_status,
    ),
    components(
        schemas(CallRecord, CallStatus, ActiveCallsResponse, StatusResponse, ErrorResponse, AnswerParams, CallEventPayload, NccoAction, WebsocketEndpoint)
    ),
    tags(
        (name = "Voicegate API", description = "Telephony webhooks and call observability for the voice gateway")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route(
            "/webhooks/answer",
            get(handlers::answer_call_get).post(handlers::answer_call_post),
        )
        .route(
            "/webhooks/events",
            get(handlers::call_events_get).post(handlers::call_events_post),
        )
        .route("/socket/{call_id}", get(relay::ws_handler))
        .route("/calls", get(handlers::get_calls))
        .route("/calls/active", get(handlers::get_active_calls))
        .route("/status", get(handlers::get_status))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Merge the stateful routes with the stateless Swagger UI.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
