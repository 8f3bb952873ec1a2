use std::net::SocketAddr;
use std::time::SystemTime;

use axum::{extract::State, http::StatusCode, routing, Json, Router};
use chrono::{DateTime, Utc};

use crate::broker::{Broker, Overview};

#[derive(Clone)]
struct AppState {
    broker: Broker,
    started: SystemTime,
}

pub fn router(broker: Broker, started: SystemTime) -> Router {
    Router::new()
        .route("/api/checkhealth", routing::get(checkhealth))
        .route("/api/overview", routing::get(overview))
        .with_state(AppState { broker, started })
}

pub async fn serve(addr: SocketAddr, router: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("http endpoints on address: {}", listener.local_addr()?);
    axum::serve(listener, router).await
}

#[tracing::instrument(skip_all)]
async fn checkhealth(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = SystemTime::now()
        .duration_since(state.started)
        .unwrap_or_default();
    let started = DateTime::<Utc>::from(state.started);

    let json = serde_json::json!({
        "status": if state.broker.overview().await.is_ok() { "ok" } else { "failure" },
        "uptime": uptime,
        "started": started,
    });

    Json(json)
}

#[tracing::instrument(skip_all)]
async fn overview(State(state): State<AppState>) -> Result<Json<Overview>, StatusCode> {
    state
        .broker
        .overview()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
