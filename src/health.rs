use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::{Db, GlobalStats};

/// Данные, доступные HTTP-обработчикам.
pub struct HealthState {
    pub db: Db,
    pub service: String,
    pub environment: String,
}

async fn root(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": state.service,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
    }))
}

/// 200 с краткой статистикой, либо 503 если база не отвечает.
async fn health_check(State(state): State<Arc<HealthState>>) -> Response {
    match state.db.global_stats().await {
        Ok(stats) => Json(json!({
            "status": "healthy",
            "service": state.service,
            "version": env!("CARGO_PKG_VERSION"),
            "environment": state.environment,
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "database": "connected",
            "stats": {
                "total_users": stats.total_users,
                "total_edits": stats.total_edits,
                "success_rate": stats.success_rate(),
            },
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "health check: database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.service,
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn stats(State(state): State<Arc<HealthState>>) -> Result<Json<GlobalStats>, StatusCode> {
    state.db.global_stats().await.map(Json).map_err(|err| {
        warn!(error = %err, "stats endpoint failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<HealthState>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    info!(%addr, "Health endpoint listening");
    axum::serve(listener, router(state))
        .await
        .context("health endpoint stopped")
}
