use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcastOrchestrator;
use crate::error::{BroadcastError, StoreError};
use crate::gateway::MessagingGateway;
use crate::settings::{Settings, SettingsStatus};
use crate::types::{BroadcastAttempt, BroadcastSummary, ConversationId, ConversationInfo};

#[derive(Clone)]
pub struct AdminState {
    pub settings: Arc<Settings>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub broadcaster: Arc<BroadcastOrchestrator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionsBody {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSettingsView {
    pub targets: Vec<ConversationId>,
    /// Comma-joined form, ready to paste back into an update.
    pub targets_raw: String,
    pub start_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBroadcastRequest {
    /// Comma, semicolon or newline separated conversation ids.
    pub targets: String,
    pub start_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBroadcastResponse {
    pub settings: BroadcastSettingsView,
    /// Tokens that were not valid ids and were dropped.
    pub rejected: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AttemptsQuery {
    limit: Option<usize>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route(
            "/settings/instructions",
            get(get_instructions).put(update_instructions),
        )
        .route(
            "/settings/broadcast",
            get(get_broadcast_settings).put(update_broadcast_settings),
        )
        .route("/conversations", get(list_conversations))
        .route("/broadcast", post(run_broadcast))
        .route("/broadcast/attempts", get(list_attempts))
        .with_state(state);

    Router::new().nest("/v1", api)
}

pub async fn serve_admin(state: Arc<AdminState>, bind: &str) -> Result<()> {
    let bind_addr = bind
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid admin bind address {:?} (expected host:port)", bind))?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind admin server to {}", bind_addr))?;
    tracing::info!("Courier admin API listening on http://{}", bind_addr);
    axum::serve(listener, router(state))
        .await
        .context("Admin server failed")?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_status(State(state): State<Arc<AdminState>>) -> Json<SettingsStatus> {
    Json(state.settings.status())
}

async fn get_instructions(State(state): State<Arc<AdminState>>) -> Json<InstructionsBody> {
    Json(InstructionsBody {
        text: state.settings.get_system_instructions(),
    })
}

async fn update_instructions(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<InstructionsBody>,
) -> Result<Json<InstructionsBody>, (StatusCode, String)> {
    state
        .settings
        .set_system_instructions(&body.text)
        .map_err(store_error)?;
    Ok(Json(InstructionsBody {
        text: state.settings.get_system_instructions(),
    }))
}

async fn get_broadcast_settings(
    State(state): State<Arc<AdminState>>,
) -> Json<BroadcastSettingsView> {
    Json(broadcast_view(&state.settings))
}

async fn update_broadcast_settings(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<UpdateBroadcastRequest>,
) -> Result<Json<UpdateBroadcastResponse>, (StatusCode, String)> {
    let parsed = state
        .settings
        .set_broadcast_settings_from_raw(&request.targets, &request.start_message)
        .map_err(store_error)?;
    Ok(Json(UpdateBroadcastResponse {
        settings: broadcast_view(&state.settings),
        rejected: parsed.rejected,
    }))
}

async fn list_conversations(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<Vec<ConversationInfo>>, (StatusCode, String)> {
    state
        .gateway
        .list_conversations()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn run_broadcast(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<BroadcastSummary>, (StatusCode, String)> {
    state
        .broadcaster
        .run()
        .await
        .map(Json)
        .map_err(broadcast_error)
}

async fn list_attempts(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<AttemptsQuery>,
) -> Result<Json<Vec<BroadcastAttempt>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    state
        .broadcaster
        .recent(limit)
        .map(Json)
        .map_err(store_error)
}

fn broadcast_view(settings: &Settings) -> BroadcastSettingsView {
    let broadcast = settings.get_broadcast_settings();
    BroadcastSettingsView {
        targets_raw: broadcast.targets_string(),
        targets: broadcast.targets,
        start_message: broadcast.start_message,
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn store_error(error: StoreError) -> (StatusCode, String) {
    match error {
        StoreError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
        StoreError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

fn broadcast_error(error: BroadcastError) -> (StatusCode, String) {
    let status = if error.is_precondition() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::CONFLICT
    };
    (status, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
