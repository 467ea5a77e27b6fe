//! C8 — Control-plane REST + WebSocket surface, built on `axum` (enrichment
//! dependency: this daemon's media/signalling stack has no REST server of
//! its own to generalize from). Every config-mutating endpoint reports both
//! the in-memory and on-disk outcome, per §4.8.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionFilter;
use crate::config::{ConfigError, ExpertConfig, PersistedConfig};
use crate::expert::ExpertClient;
use crate::hub::EventHub;
use crate::orchestrator::OrchestratorHandle;
use crate::tools::order::Order;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub hub: Arc<EventHub>,
    pub expert: Arc<ExpertClient>,
    pub admission: Arc<AdmissionFilter>,
    pub order: Arc<Mutex<Option<Order>>>,
    pub config_path: PathBuf,
    pub persisted: Arc<Mutex<PersistedConfig>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/call/accept", post(call_accept))
        .route("/call/hangup", post(call_hangup))
        .route("/ai/mute", post(ai_mute))
        .route("/ai/unmute", post(ai_unmute))
        .route("/model", get(get_model).post(set_model))
        .route("/instructions", get(get_instructions).post(set_instructions))
        .route("/order", get(get_order).delete(clear_order))
        .route("/expert/config", get(get_expert_config).post(set_expert_config))
        .route("/expert/models", get(get_expert_models))
        .route("/expert/stats", get(get_expert_stats))
        .route(
            "/expert/instructions",
            get(get_expert_instructions).post(set_expert_instructions),
        )
        .route("/firewall", get(get_firewall).post(set_firewall))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "callbridge"
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.status().await {
        Some(snapshot) => Json(json!(snapshot)),
        None => Json(json!({"error": "orchestrator not running"})),
    }
}

async fn call_accept(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.accept_call();
    Json(json!({"ok": true}))
}

async fn call_hangup(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.hangup_call();
    Json(json!({"ok": true}))
}

async fn ai_mute(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.mute();
    Json(json!({"ok": true}))
}

async fn ai_unmute(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.unmute();
    Json(json!({"ok": true}))
}

async fn get_model(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"model": state.persisted.lock().model}))
}

#[derive(Deserialize)]
struct SetModelRequest {
    model: String,
}

async fn set_model(State(state): State<AppState>, Json(body): Json<SetModelRequest>) -> impl IntoResponse {
    state.orchestrator.set_model(body.model.clone());
    let persisted_ok = {
        let mut persisted = state.persisted.lock();
        persisted.model = body.model;
        persisted.save(&state.config_path)
    };
    persist_response(persisted_ok)
}

/// `/instructions`: the realtime voice AI session's own `instructions`.
async fn get_instructions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"instructions": state.orchestrator.instructions().await.unwrap_or_default()}))
}

#[derive(Deserialize)]
struct SetInstructionsRequest {
    instructions: String,
}

async fn set_instructions(
    State(state): State<AppState>,
    Json(body): Json<SetInstructionsRequest>,
) -> impl IntoResponse {
    state.orchestrator.set_instructions(body.instructions);
    Json(json!({"applied": true}))
}

/// `/expert/instructions`: the text-escalation expert assistant's system
/// prompt, distinct from the voice AI session's `/instructions`.
async fn get_expert_instructions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"instructions": state.expert.instructions()}))
}

async fn set_expert_instructions(
    State(state): State<AppState>,
    Json(body): Json<SetInstructionsRequest>,
) -> impl IntoResponse {
    state.expert.set_instructions(body.instructions);
    Json(json!({"applied": true}))
}

async fn get_order(State(state): State<AppState>) -> impl IntoResponse {
    match state.order.lock().as_ref() {
        Some(order) => Json(json!(order)),
        None => Json(json!(null)),
    }
}

async fn clear_order(State(state): State<AppState>) -> impl IntoResponse {
    *state.order.lock() = None;
    Json(json!({"ok": true}))
}

#[derive(Serialize)]
struct ExpertConfigResponse {
    enabled_models: Vec<String>,
    default_model: String,
    min_confidence: f32,
}

async fn get_expert_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.persisted.lock().expert_config.clone();
    Json(json!(ExpertConfigResponse {
        enabled_models: config.enabled_models,
        default_model: config.default_model,
        min_confidence: config.min_confidence,
    }))
}

async fn set_expert_config(
    State(state): State<AppState>,
    Json(body): Json<ExpertConfig>,
) -> impl IntoResponse {
    state.expert.set_min_confidence(body.min_confidence);
    let persisted_ok = {
        let mut persisted = state.persisted.lock();
        persisted.expert_config = body;
        persisted.save(&state.config_path)
    };
    persist_response(persisted_ok)
}

async fn get_expert_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.persisted.lock().expert_config.enabled_models))
}

async fn get_expert_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.expert.stats()))
}

async fn get_firewall(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "enabled": state.admission.is_enabled(),
        "allowed_networks": state.admission.allowed_networks(),
    }))
}

#[derive(Deserialize)]
struct SetFirewallRequest {
    enabled: bool,
    allowed_networks: Vec<String>,
}

async fn set_firewall(State(state): State<AppState>, Json(body): Json<SetFirewallRequest>) -> impl IntoResponse {
    state.admission.set_enabled(body.enabled);
    let mut parsed = Vec::with_capacity(body.allowed_networks.len());
    for entry in &body.allowed_networks {
        match entry.parse() {
            Ok(cidr) => parsed.push(cidr),
            Err(_) => return Json(json!({"ok": false, "error": format!("invalid CIDR: {entry}")})),
        }
    }
    state.admission.set_allowed_networks(parsed);
    state.hub.broadcast(crate::hub::HubEvent::FirewallStatus {
        enabled: body.enabled,
        allowed_networks: body.allowed_networks,
    });
    Json(json!({"ok": true}))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: axum::extract::ws::WebSocket, state: AppState) {
    use axum::extract::ws::Message;

    let (observer_id, mut events) = state.hub.register();

    let registered = state.orchestrator.status().await.map(|s| s.registered).unwrap_or(false);
    let initial = crate::hub::HubEvent::Status {
        registered,
        firewall_enabled: state.admission.is_enabled(),
    };
    if let Ok(text) = serde_json::to_string(&initial) {
        if socket.send(Message::Text(text)).await.is_err() {
            state.hub.unregister(observer_id);
            return;
        }
    }

    while let Some(event) = events.recv().await {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    state.hub.unregister(observer_id);
}

fn persist_response(result: Result<(), ConfigError>) -> Json<serde_json::Value> {
    match result {
        Ok(()) => Json(json!({"applied": true, "persisted": true})),
        Err(err) => Json(json!({"applied": true, "persisted": false, "error": err.to_string()})),
    }
}
