//! HTTP admin API
//!
//! JSON endpoints for the GUI and operators, plus the Prometheus text
//! endpoint:
//!
//! ```text
//! GET    /api/v1/status       daemon state overview
//! GET    /api/v1/config       current session config
//! POST   /api/v1/config       replace and persist the session config
//! GET    /api/v1/rules        current rule list
//! PUT    /api/v1/rules        replace all rules
//! POST   /api/v1/rules        add one rule
//! DELETE /api/v1/rules/{id}   remove one rule
//! GET    /api/v1/stats        per-rule match counters
//! POST   /api/v1/geo/reload   reload geo databases from disk
//! GET    /metrics             Prometheus metrics
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ConfigManager, SessionConfig};
use crate::geo::{GeoIpDatabase, GeoSiteDatabase};
use crate::rules::{Rule, RuleEngine};
use crate::tunnel::TunnelClient;

use super::metrics::{REGISTRY, SESSIONS_ACTIVE};

/// Shared state behind the admin API.
pub struct ApiState {
    pub engine: Arc<RuleEngine>,
    pub tunnel: Arc<TunnelClient>,
    pub config: parking_lot::RwLock<SessionConfig>,
    /// Persistence; absent in tests
    pub manager: Option<ConfigManager>,
    pub geoip_file: Option<PathBuf>,
    pub geosite_file: Option<PathBuf>,
    pub started_at: Instant,
}

impl ApiState {
    fn persist_rules(&self) {
        if let Some(manager) = &self.manager {
            if let Err(e) = manager.save_rules(&self.engine.get_rules()) {
                warn!("Failed to persist rules: {}", e);
            }
        }
    }
}

/// Build the API router.
pub fn build_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/config", get(get_config).post(set_config))
        .route(
            "/api/v1/rules",
            get(get_rules).put(put_rules).post(add_rule),
        )
        .route("/api/v1/rules/:id", axum::routing::delete(delete_rule))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/geo/reload", post(reload_geo))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Serve the API until shutdown.
pub async fn start_api_server(
    addr: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = build_api_router(state);

    info!("Admin API listening on http://{}/api/v1", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind admin API to {}: {}", addr, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Admin API shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Admin API error: {}", e);
        });
}

async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "state": "running",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tunnel_connected": state.tunnel.is_connected().await,
        "active_sessions": SESSIONS_ACTIVE.get(),
    }))
}

async fn get_config(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.config.read().clone())
}

async fn set_config(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<SessionConfig>,
) -> impl IntoResponse {
    if let Some(manager) = &state.manager {
        if let Err(e) = manager.save(&config) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    *state.config.write() = config;
    // listeners and tunnel pick the new values up on restart
    Json(json!({"status": "saved", "restart_required": true})).into_response()
}

async fn get_rules(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.engine.get_rules())
}

async fn put_rules(
    State(state): State<Arc<ApiState>>,
    Json(rules): Json<Vec<Rule>>,
) -> impl IntoResponse {
    match state.engine.update_rules(rules) {
        Ok(()) => {
            state.persist_rules();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn add_rule(
    State(state): State<Arc<ApiState>>,
    Json(rule): Json<Rule>,
) -> impl IntoResponse {
    match state.engine.add_rule(rule) {
        Ok(()) => {
            state.persist_rules();
            StatusCode::CREATED.into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn delete_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.engine.remove_rule(&id) {
        state.persist_rules();
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, format!("no rule with id {}", id)).into_response()
    }
}

async fn get_stats(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.engine.get_match_stats())
}

async fn reload_geo(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let mut reloaded = Vec::new();

    if let Some(path) = &state.geoip_file {
        match GeoIpDatabase::load(path) {
            Ok(db) => {
                state.engine.set_geoip(Arc::new(db));
                reloaded.push("geoip");
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
    if let Some(path) = &state.geosite_file {
        match GeoSiteDatabase::load(path) {
            Ok(db) => {
                state.engine.set_geosite(Arc::new(db));
                reloaded.push("geosite");
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    Json(json!({"reloaded": reloaded})).into_response()
}

async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}
