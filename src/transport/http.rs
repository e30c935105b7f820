//! HTTP front end
//!
//! ## Endpoints
//!
//! - `POST /api/{identifier}/{*request_topic}` - route a request to the broker
//!   connection `identifier`, publishing on `request_topic`
//! - `GET /health` - liveness plus the registered broker ids
//!
//! The request body is optional JSON: `{"payload": {...}, "is_request": true}`.
//! The correlation id is taken from the `X-Correlation-ID` header when present
//! and echoed back on every routed response.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Request, Response};
use crate::service::ServiceManager;
use crate::utils::Result;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const SERVICE_NAME: &str = "popgate";

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<ServiceManager>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiRequestBody {
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    is_request: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub brokers: Vec<String>,
}

pub fn router(manager: Arc<ServiceManager>) -> Router {
    Router::new()
        .route("/api/{identifier}/{*request_topic}", post(handle_api_request))
        .route("/health", get(health))
        .with_state(HttpState { manager })
}

/// Serves the front end on `addr` until `shutdown` resolves, then lets
/// in-flight requests finish.
pub async fn start_http_server<F>(addr: &str, manager: Arc<ServiceManager>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn handle_api_request(
    State(state): State<HttpState>,
    Path((identifier, request_topic)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => {
            warn!(target_broker = %identifier, topic = %request_topic, error = %e, "Rejecting request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid request body: {e}") })),
            )
                .into_response();
        }
    };

    let correlation_id = headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(
        target_broker = %identifier,
        topic = %request_topic,
        correlation_id = %correlation_id,
        expects_reply = body.is_request,
        "Received HTTP request"
    );

    let request = Request {
        topic: request_topic,
        payload: body.payload.unwrap_or_else(|| json!({})),
        correlation_id: correlation_id.clone(),
        target_broker_id: identifier,
        expects_reply: body.is_request,
    };

    match state.manager.route_request(request).await {
        Some(response) => into_http_response(response),
        None => (
            StatusCode::OK,
            [(CORRELATION_ID_HEADER, correlation_id)],
            Json(json!({ "success": true })),
        )
            .into_response(),
    }
}

fn parse_body(body: &[u8]) -> serde_json::Result<ApiRequestBody> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ApiRequestBody::default());
    }
    serde_json::from_slice(body)
}

fn into_http_response(response: Response) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(CORRELATION_ID_HEADER, response.correlation_id)],
        Json(response.payload),
    )
        .into_response()
}

async fn health(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        brokers: state.manager.registered_broker_ids(),
    })
}
