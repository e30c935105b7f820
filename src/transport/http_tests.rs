use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request as HttpRequest, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::config::BrokerConfig;
use crate::service::ServiceManager;
use crate::transport::Transport;
use crate::transport::http::{CORRELATION_ID_HEADER, router};
use crate::transport::memory::{MemoryBroker, MemoryTransport};
use crate::transport::message::Envelope;

async fn setup(ids: &[&str]) -> (Router, Arc<MemoryBroker>) {
    let broker = MemoryBroker::new();
    let configs = ids
        .iter()
        .map(|id| BrokerConfig::new(id, "localhost", 1883))
        .collect();
    let factory_broker = Arc::clone(&broker);
    let mut manager = ServiceManager::with_transport_factory(
        configs,
        move |config: &BrokerConfig| -> Arc<dyn Transport> {
            Arc::new(MemoryTransport::new(&factory_broker, &config.broker_id))
        },
    );
    manager.initialize().await.unwrap();
    (router(Arc::new(manager)), broker)
}

fn post(uri: &str, body: &str) -> HttpRequest<Body> {
    HttpRequest::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_lists_brokers() {
    let (app, _broker) = setup(&["cloud", "edge"]).await;

    let response = app
        .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({ "status": "ok", "service": "popgate", "brokers": ["cloud", "edge"] })
    );
}

#[tokio::test]
async fn test_fire_and_forget_returns_success() {
    let (app, broker) = setup(&["edge"]).await;

    let response = app
        .oneshot(post("/api/edge/sensors/temp/set", r#"{"payload": {"value": 21}}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
    assert_eq!(json_body(response).await, json!({ "success": true }));

    let published = broker.published_on("sensors/temp/set");
    assert_eq!(published.len(), 1);
    let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(payload, json!({ "value": 21 }));
}

#[tokio::test]
async fn test_empty_body_is_accepted() {
    let (app, broker) = setup(&["edge"]).await;

    let response = app.oneshot(post("/api/edge/ping", "")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let published = broker.published_on("ping");
    let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(payload, json!({}));
}

#[tokio::test]
async fn test_invalid_body_is_bad_request() {
    let (app, broker) = setup(&["edge"]).await;

    let response = app.oneshot(post("/api/edge/ping", "{oops")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_unknown_broker_is_not_found() {
    let (app, _broker) = setup(&["edge"]).await;

    let request = HttpRequest::post("/api/ghost/ping")
        .header(CORRELATION_ID_HEADER, "abc-123")
        .body(Body::from(r#"{"is_request": true}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[CORRELATION_ID_HEADER], "abc-123");
}

#[tokio::test]
async fn test_request_returns_downstream_response() {
    let (app, broker) = setup(&["edge"]).await;
    let mut service = broker.subscribe("service", "svc/lookup");

    let responder = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let message = tokio::time::timeout(Duration::from_secs(2), service.recv())
                .await
                .unwrap()
                .unwrap();
            let envelope = Envelope::decode(&message.payload).unwrap();
            assert_eq!(envelope.payload, json!({ "key": "k1" }));
            let reply = json!({
                "correlation_id": envelope.correlation_id,
                "payload": { "value": "v1" },
                "status_code": 202
            });
            broker.publish("edge", reply.to_string());
        })
    };

    let request = HttpRequest::post("/api/edge/svc/lookup")
        .header(CORRELATION_ID_HEADER, "req-1")
        .body(Body::from(r#"{"payload": {"key": "k1"}, "is_request": true}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    responder.await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[CORRELATION_ID_HEADER], "req-1");
    assert_eq!(json_body(response).await, json!({ "value": "v1" }));
}
