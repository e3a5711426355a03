//! HTTP surface: liveness, readiness, and the admission/audit ingress into
//! the Admission Collector. `AppState` and `create_app` are split apart so
//! the router can be exercised from tests without a bound socket.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reverser_types::{Operation, ResourceIdentifier, UserInfo};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use reverser_core::AdmissionCollector;

use crate::controllers::Context;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
    pub admission: Arc<AdmissionCollector>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admission", post(admission_handler))
        .route("/audit", post(audit_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.ctx.is_ready() {
        Ok(Json(json!({ "status": "ready" })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Minimal shape this controller needs out of an admission review request:
/// the object's group/version/resource/namespace/name, the operation, and
/// the requesting user. A real `ValidatingWebhookConfiguration` payload
/// carries much more; everything else is ignored.
#[derive(Debug, Deserialize)]
struct AdmissionPayload {
    group: String,
    version: String,
    resource: String,
    #[serde(default)]
    namespace: String,
    name: String,
    operation: Operation,
    #[serde(default)]
    username: String,
    #[serde(default)]
    uid: String,
}

async fn admission_handler(State(state): State<AppState>, Json(payload): Json<AdmissionPayload>) -> Json<Value> {
    record(&state, payload).await;
    // Always allow: this controller observes, it never rejects admission.
    Json(json!({ "allowed": true }))
}

async fn audit_handler(State(state): State<AppState>, Json(payload): Json<AdmissionPayload>) -> StatusCode {
    record(&state, payload).await;
    StatusCode::ACCEPTED
}

async fn record(state: &AppState, payload: AdmissionPayload) {
    let identifier = ResourceIdentifier::new(&payload.group, &payload.version, &payload.resource, &payload.namespace, &payload.name);
    let user = UserInfo { username: payload.username, uid: payload.uid };
    state.admission.record(identifier, payload.operation, user).await;
}
