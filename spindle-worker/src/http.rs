use crate::server::WorkerServer;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// The worker's status surface.
pub fn router(server: Arc<WorkerServer>) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(server)
}

pub async fn serve(server: Arc<WorkerServer>, addr: SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Worker HTTP interface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(server)).await?;
    Ok(())
}

/// `{completed, queued, active}` counters.
async fn status(State(server): State<Arc<WorkerServer>>) -> Json<Value> {
    Json(serde_json::to_value(server.status()).unwrap_or_else(|_| json!({})))
}
