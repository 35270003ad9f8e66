//! HTTP surface: provider webhooks, web chat API, health.
//!
//! Handlers only decode, normalize and hand off to the router. Status codes:
//! malformed payload → 400, history/persistence failure → 503 so the
//! provider retries, otherwise 200 with the triage outcome.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::channels::WebChannel;
use crate::error::NormalizeError;
use crate::pipeline::dispatcher::SmsStatusPayload;
use crate::pipeline::normalize::{InboundPayload, SmsPayload, WebPayload, WhatsAppPayload};
use crate::pipeline::types::TriageOutcome;
use crate::pipeline::{Normalizer, TriageRouter};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub normalizer: Arc<Normalizer>,
    pub router: Arc<TriageRouter>,
}

/// Build the application router. `web` serves `/ws/chat`.
pub fn app(state: AppState, web: &WebChannel) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/whatsapp", post(whatsapp_webhook))
        .route("/webhooks/sms", post(sms_webhook))
        .route("/webhooks/sms/status", post(sms_status_webhook))
        .route("/webhooks/email", post(email_webhook))
        .route("/api/chat", post(web_chat))
        .route("/api/chat/{thread_id}/history", get(chat_history))
        .with_state(state)
        .merge(web.router())
        .layer(ServiceBuilder::new().layer(cors))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ai-concierge"
    }))
}

// ── Inbound ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TriageResponse {
    thread_id: String,
    message_id: String,
    #[serde(flatten)]
    outcome: TriageOutcome,
}

async fn whatsapp_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    match serde_json::from_slice::<WhatsAppPayload>(&body) {
        Ok(payload) => ingest(&state, InboundPayload::WhatsApp(payload)).await,
        Err(e) => bad_request("whatsapp", &NormalizeError::from(e)),
    }
}

async fn sms_webhook(State(state): State<AppState>, Form(payload): Form<SmsPayload>) -> Response {
    ingest(&state, InboundPayload::Sms(payload)).await
}

async fn email_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    ingest(&state, InboundPayload::Email(body.to_vec())).await
}

async fn web_chat(State(state): State<AppState>, body: Bytes) -> Response {
    match serde_json::from_slice::<WebPayload>(&body) {
        Ok(payload) => ingest(&state, InboundPayload::Web(payload)).await,
        Err(e) => bad_request("web", &NormalizeError::from(e)),
    }
}

async fn ingest(state: &AppState, payload: InboundPayload) -> Response {
    let message = match state.normalizer.normalize(payload) {
        Ok(message) => message,
        Err(e) => return bad_request("inbound", &e),
    };
    let thread_id = message.thread_id.clone();
    let message_id = message.id.clone();

    match state.router.triage(message).await {
        Ok(outcome) => {
            info!(
                thread_id = %thread_id,
                message_id = %message_id,
                action = outcome.action.label(),
                degraded = outcome.degraded.is_some(),
                "Triage complete"
            );
            (
                StatusCode::OK,
                Json(TriageResponse {
                    thread_id,
                    message_id,
                    outcome,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(thread_id = %thread_id, message_id = %message_id, error = %e, "Triage failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

fn bad_request(source: &str, e: &NormalizeError) -> Response {
    warn!(source, error = %e, "Rejected inbound payload");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}

// ── Delivery status ─────────────────────────────────────────────────────

async fn sms_status_webhook(
    State(state): State<AppState>,
    Form(payload): Form<SmsStatusPayload>,
) -> Response {
    match state.router.dispatcher().record_sms_status(&payload).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "recorded"}))).into_response(),
        Err(e) => {
            error!(provider_id = %payload.message_sid, error = %e, "Failed to record SMS status");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

// ── History ─────────────────────────────────────────────────────────────

async fn chat_history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Response {
    match state.router.history().get_history(&thread_id).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({
                "thread_id": thread_id,
                "messages": messages,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(thread_id = %thread_id, error = %e, "Failed to load history");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
