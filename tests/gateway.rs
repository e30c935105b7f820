use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request as HttpRequest, StatusCode};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

use popgate::config::BrokerConfig;
use popgate::service::ServiceManager;
use popgate::transport::http::{CORRELATION_ID_HEADER, router, start_http_server};
use popgate::transport::memory::{MemoryBroker, MemoryTransport};
use popgate::transport::message::Envelope;
use popgate::transport::{Inbound, Transport};

struct Mesh {
    manager: Arc<ServiceManager>,
    brokers: HashMap<String, Arc<MemoryBroker>>,
}

async fn mesh(configs: Vec<BrokerConfig>) -> Mesh {
    let brokers: HashMap<String, Arc<MemoryBroker>> = configs
        .iter()
        .map(|c| (c.broker_id.clone(), MemoryBroker::new()))
        .collect();
    let factory_brokers = brokers.clone();
    let mut manager = ServiceManager::with_transport_factory(
        configs,
        move |config: &BrokerConfig| -> Arc<dyn Transport> {
            Arc::new(MemoryTransport::new(
                &factory_brokers[&config.broker_id],
                &config.broker_id,
            ))
        },
    );
    manager.initialize().await.unwrap();
    Mesh {
        manager: Arc::new(manager),
        brokers,
    }
}

async fn next_message(rx: &mut UnboundedReceiver<Inbound>) -> Inbound {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message within 2s")
        .expect("subscription closed")
}

/// Plays a service on `broker`: answers every request on `topic` with
/// `{"echo": <request payload>}`.
fn spawn_echo_service(broker: &Arc<MemoryBroker>, topic: &str) {
    let mut requests = broker.subscribe("echo-service", topic);
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            let Ok(envelope) = Envelope::decode(&message.payload) else {
                continue;
            };
            let Some(reply_to) = envelope.identifier.clone() else {
                continue;
            };
            let reply = json!({
                "identifier": "echo-service",
                "correlation_id": envelope.correlation_id,
                "payload": { "echo": envelope.payload }
            });
            broker.publish(&reply_to, reply.to_string());
        }
    });
}

#[tokio::test]
async fn mqtt_client_reaches_service_on_another_broker() {
    let mut edge = BrokerConfig::new("edge", "edge.local", 1883);
    edge.subscribe_topics = vec!["gateway/#".to_string()];
    let cloud = BrokerConfig::new("cloud", "cloud.local", 1883);
    let mesh = mesh(vec![edge, cloud]).await;

    spawn_echo_service(&mesh.brokers["cloud"], "gateway/lookup");
    let mut client = mesh.brokers["edge"].subscribe("device-7", "device-7");

    let request = json!({
        "identifier": "device-7",
        "correlation_id": "req-42",
        "target_broker_id": "cloud",
        "is_response": true,
        "payload": { "sensor": "t1" }
    });
    mesh.brokers["edge"].publish("gateway/lookup", request.to_string());

    let reply = next_message(&mut client).await;
    let payload: Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(payload, json!({ "echo": { "sensor": "t1" } }));

    mesh.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn http_request_is_answered_by_mqtt_service() {
    let mesh = mesh(vec![BrokerConfig::new("edge", "edge.local", 1883)]).await;
    spawn_echo_service(&mesh.brokers["edge"], "svc/echo");
    let app = router(Arc::clone(&mesh.manager));

    let request = HttpRequest::post("/api/edge/svc/echo")
        .header(CORRELATION_ID_HEADER, "http-1")
        .body(Body::from(r#"{"payload": {"n": 3}, "is_request": true}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CORRELATION_ID_HEADER], "http-1");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "echo": { "n": 3 } }));
}

#[tokio::test]
async fn http_server_stops_on_shutdown_signal() {
    let mesh = mesh(Vec::new()).await;

    let served = tokio::time::timeout(
        Duration::from_secs(2),
        start_http_server("127.0.0.1:0", Arc::clone(&mesh.manager), async {}),
    )
    .await
    .expect("server did not stop");
    assert!(served.is_ok());
}
