//! Operator API tests: the JSON surface, the error envelope, and the auth
//! gate, driven directly against the router without a listener.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use otb_bridge::{http, Bridge, BridgeDeps, LoopbackClientFactory, LoopbackHub};
use otb_core::{BridgeSpec, MemoryCredentialStore};
use otb_io::ingest::loopback::loopback;
use otb_io::ingest::token::StaticBearer;

fn bridge_with(auth_enabled: bool) -> Arc<Bridge> {
    let yaml = format!(
        r#"
sources:
  - name: s1
    protocol_type: opcua
    endpoint: "opc.tcp://plc:4840"
zerobus:
  workspace_host: "https://acme.example.com"
  zerobus_endpoint: "https://ingest.example.com:443"
  default_target:
    catalog: edge
    schema: ot
    table: telemetry
  auth:
    client_id: svc
    client_secret_ref: zerobus-secret
web_ui:
  bind: "127.0.0.1:8480"
  auth:
    enabled: {auth_enabled}
"#
    );
    let spec = BridgeSpec::from_yaml(&yaml).unwrap();
    let (transport, _control) = loopback();
    let deps = BridgeDeps {
        factory: Arc::new(LoopbackClientFactory::new(Arc::new(LoopbackHub::new()))),
        credentials: Arc::new(MemoryCredentialStore::new()),
        transport: Arc::new(transport),
        bearer: Some(Arc::new(StaticBearer("test-token".into()))),
        env_client_secret: None,
    };
    Arc::new(Bridge::new(spec, deps).unwrap())
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_endpoint_returns_bridge_summary() {
    let app = http::router(bridge_with(false));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["running"], false);
    assert_eq!(json["sources"][0]["name"], "s1");
    assert_eq!(json["sources"][0]["breaker"]["state"], "closed");
    assert_eq!(json["breaker"]["state"], "closed");
}

#[tokio::test]
async fn auth_gate_rejects_missing_header() {
    let app = http::router(bridge_with(true));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "auth_failed");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .header("authorization", "Bearer operator-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_source_yields_error_envelope() {
    let app = http::router(bridge_with(false));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sources/nope/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "config_invalid");
    assert!(json["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn source_crud_over_http() {
    let app = http::router(bridge_with(false));

    let new_source = serde_json::json!({
        "name": "s2",
        "protocol_type": "modbus",
        "endpoint": "modbus://plc:502",
        "enabled": false,
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sources")
                .header("content-type", "application/json")
                .body(Body::from(new_source.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 2);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/sources/s2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn zerobus_config_is_served_with_masked_secrets() {
    let app = http::router(bridge_with(false));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/zerobus/config")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["default_target"]["table"], "telemetry");
    // Only the secret's name is ever present
    assert_eq!(json["auth"]["client_secret_ref"], "zerobus-secret");
    assert!(json["auth"].get("client_secret").is_none());
}

#[tokio::test]
async fn diagnostics_pipeline_is_empty_before_any_traffic() {
    let app = http::router(bridge_with(false));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/diagnostics/pipeline")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["pairs"].as_array().unwrap().len(), 0);
}
