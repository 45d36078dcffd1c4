use crate::server::InterfaceServer;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use spindle_core::SpindleError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// The interface's HTTP surface: `/function/<plugin path>` with kwargs in
/// the query string and/or a form body.
pub fn router(server: Arc<InterfaceServer>) -> Router {
    Router::new()
        .route(
            "/function/{*function_name}",
            get(call_function).post(call_function),
        )
        .layer(CorsLayer::permissive())
        .with_state(server)
}

pub async fn serve(server: Arc<InterfaceServer>, addr: SocketAddr) -> anyhow::Result<()> {
    info!(addr = %addr, "Interface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(server)).await?;
    Ok(())
}

async fn call_function(
    State(server): State<Arc<InterfaceServer>>,
    Path(function_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    // Form-body kwargs merge under the query string's; inputs arrive UTF-8
    // (lossily decoded when they are not).
    let mut kwargs: HashMap<String, String> = url::form_urlencoded::parse(&body)
        .into_owned()
        .collect();
    kwargs.extend(query);

    match server.create_reservation(&function_name, kwargs).await {
        Ok(value) => Json(value).into_response(),
        Err(error) => error_response(&error),
    }
}

fn error_response(error: &SpindleError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": error.to_string(),
        "status": error.status_code(),
    });
    (status, Json(body)).into_response()
}
