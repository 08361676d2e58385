// src/admin.rs

use crate::error::{AppError, Result};
use crate::key_manager::KeyView;
use crate::pool::{KeyFilter, KeyStatus, PoolStats, Strategy};
use crate::refresher::RefreshSummary;
use crate::state::AppState;
use axum::{
    extract::{Query, Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    pub status: Option<KeyStatus>,
    /// Only keys the selector could pick right now.
    #[serde(default)]
    pub eligible: bool,
}

#[derive(Debug, Deserialize)]
pub struct KeysRequest {
    pub api_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AddKeysResponse {
    pub added: Vec<KeyView>,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct RemoveKeysResponse {
    pub removed: Vec<KeyView>,
    pub missing: usize,
}

#[derive(Debug, Serialize)]
pub struct StrategyView {
    pub id: u8,
    pub name: &'static str,
    pub label: &'static str,
}

impl From<Strategy> for StrategyView {
    fn from(strategy: Strategy) -> Self {
        Self {
            id: strategy.id(),
            name: strategy.name(),
            label: strategy.label(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StrategiesResponse {
    pub default: StrategyView,
    pub models: BTreeMap<String, StrategyView>,
    pub available: Vec<StrategyView>,
}

/// Constant-time string comparison to prevent timing attacks
fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Requires `Authorization: Bearer <admin_token>` when a token is configured.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let Some(expected) = state.config.server.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if secure_compare(token.trim(), expected) => Ok(next.run(req).await),
        _ => {
            warn!("Admin authentication failed: invalid or missing token");
            Err(AppError::Unauthorized)
        }
    }
}

pub fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().nest(
        "/admin",
        Router::new()
            .route("/keys", get(list_keys).post(add_keys).delete(remove_keys))
            .route("/keys/refresh", post(force_refresh))
            .route("/stats", get(pool_stats))
            .route("/strategies", get(list_strategies))
            .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware)),
    )
}

/// `GET /admin/keys?status=active&eligible=true`
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> Json<Vec<KeyView>> {
    let filter = match (query.eligible, query.status) {
        (true, _) => KeyFilter::Eligible,
        (false, Some(status)) => KeyFilter::Status(status),
        (false, None) => KeyFilter::All,
    };
    Json(state.key_manager.list_keys(filter))
}

/// `POST /admin/keys` with `{"api_keys": [...]}`. Blank and duplicate keys are skipped.
pub async fn add_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeysRequest>,
) -> Result<Json<AddKeysResponse>> {
    if request.api_keys.is_empty() {
        return Err(AppError::validation("api_keys", "must contain at least one key"));
    }

    let mut added = Vec::new();
    let mut skipped = 0;
    for key in &request.api_keys {
        match state.key_manager.add_key(key).await {
            Ok(view) => added.push(view),
            Err(AppError::Validation { .. }) => skipped += 1,
            Err(e) => return Err(e),
        }
    }
    info!(added = added.len(), skipped, "Admin added keys");
    Ok(Json(AddKeysResponse { added, skipped }))
}

/// `DELETE /admin/keys` with `{"api_keys": [...]}`.
pub async fn remove_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeysRequest>,
) -> Json<RemoveKeysResponse> {
    let mut removed = Vec::new();
    let mut missing = 0;
    for key in request.api_keys.iter().map(|k| k.trim()) {
        match state.key_manager.remove_key(key) {
            Ok(view) => removed.push(view),
            Err(_) => missing += 1,
        }
    }
    info!(removed = removed.len(), missing, "Admin removed keys");
    Json(RemoveKeysResponse { removed, missing })
}

/// `POST /admin/keys/refresh`
pub async fn force_refresh(State(state): State<Arc<AppState>>) -> Result<Json<RefreshSummary>> {
    let summary = state.key_manager.force_refresh_all_keys_balance().await?;
    Ok(Json(summary))
}

/// `GET /admin/stats`
pub async fn pool_stats(State(state): State<Arc<AppState>>) -> Json<PoolStats> {
    Json(state.key_manager.stats())
}

/// `GET /admin/strategies`
pub async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<StrategiesResponse> {
    let strategies = state.key_manager.strategies();
    Json(StrategiesResponse {
        default: strategies.default.into(),
        models: strategies
            .models
            .into_iter()
            .map(|(model, strategy)| (model, strategy.into()))
            .collect(),
        available: Strategy::ALL.iter().copied().map(StrategyView::from).collect(),
    })
}
