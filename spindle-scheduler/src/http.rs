use crate::server::SchedulerServer;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// The scheduler's HTTP surface: the live-add entry point and telemetry.
pub fn router(server: Arc<SchedulerServer>) -> Router {
    Router::new()
        .route(
            "/function/schedulerserver/remoteaddtoheap",
            get(remote_add_to_heap),
        )
        .route("/status", get(status))
        .with_state(server)
}

/// Start the listener.
pub async fn serve(server: Arc<SchedulerServer>, addr: SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Scheduler HTTP interface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(server)).await?;
    Ok(())
}

/// `GET /function/schedulerserver/remoteaddtoheap?uuid=<hex32>&type=<name>`
///
/// Missing parameters are the only visible error; an undecodable UUID or
/// unknown type is logged and dropped so a misconfigured peer cannot wedge
/// the intake.
async fn remote_add_to_heap(
    State(server): State<Arc<SchedulerServer>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let (Some(uuid), Some(function_name)) = (params.get("uuid"), params.get("type")) else {
        return Json(json!({
            "error": "invalid parameters passed: required parameters are uuid and type"
        }));
    };
    if !uuid.is_empty() {
        server.live_add(uuid, function_name);
    }
    Json(json!({}))
}

async fn status(State(server): State<Arc<SchedulerServer>>) -> Json<Value> {
    Json(serde_json::to_value(server.status()).unwrap_or_else(|_| json!({})))
}
