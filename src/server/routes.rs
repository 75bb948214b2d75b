/// REST API routes.
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::reconcile::ReconcileReport;
use crate::service::{HealthReport, ProofRequest, ProofResponse, ProofView, VerifyResponse};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;
const DEFAULT_RECONCILE_LIMIT: usize = 100;

type ApiResult<T> = Result<Json<T>, ApiError>;

// ─── Service ─────────────────────────────────────────────

#[derive(Serialize)]
struct ServiceDescriptor {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    endpoints: [(&'static str, &'static str); 6],
}

/// GET /
async fn root() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        status: "running",
        service: "proof-anchor",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: [
            ("POST", "/prompt"),
            ("POST", "/verify"),
            ("GET", "/proof/{tx_hash}"),
            ("GET", "/proofs"),
            ("POST", "/reconcile"),
            ("GET", "/health"),
        ],
    })
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.service.health().await)
}

pub fn service_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
}

// ─── Proofs ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    prompt: String,
    response: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// POST /prompt: generate a response and anchor the proof.
async fn create_proof(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProofRequest>,
) -> ApiResult<ProofResponse> {
    Ok(Json(state.service.prove(req).await?))
}

/// POST /verify: check a (prompt, response) pair against both stores.
async fn verify_proof(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<VerifyResponse> {
    let verification = state.service.verify(&req.prompt, &req.response).await?;
    Ok(Json(verification.into()))
}

/// GET /proof/{tx_hash}
async fn get_proof(
    State(state): State<Arc<AppState>>,
    Path(tx_hash): Path<String>,
) -> ApiResult<ProofView> {
    Ok(Json(state.service.lookup(&tx_hash).await?))
}

/// GET /proofs?limit=N: most recent proofs first.
async fn list_proofs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<ProofView>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    Ok(Json(state.service.recent(limit).await?))
}

/// POST /reconcile?limit=N: repair records whose confirmation landed late.
async fn reconcile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<ReconcileReport> {
    let limit = query.limit.unwrap_or(DEFAULT_RECONCILE_LIMIT);
    Ok(Json(state.service.reconcile(limit).await?))
}

pub fn proof_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/prompt", post(create_proof))
        .route("/verify", post(verify_proof))
        .route("/proof/{tx_hash}", get(get_proof))
        .route("/proofs", get(list_proofs))
        .route("/reconcile", post(reconcile))
}
