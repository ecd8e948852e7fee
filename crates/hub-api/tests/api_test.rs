//! Router tests for the publish, dead-letter and health endpoints.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hub_api::{create_router, AppState};
use hub_core::{CoordinationStore, Manifest, RetrySchedule, ServiceDescriptor};
use hub_delivery::Hub;
use hub_testing::TestEnv;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{matchers, Mock, ResponseTemplate};

fn manifest(env: &TestEnv) -> Result<Manifest> {
    Ok(Manifest::new([
        ServiceDescriptor::publisher("orders", ["order.created"]),
        ServiceDescriptor::subscriber("billing", ["order.created"], env.endpoint("/billing")?)
            .with_retry_schedule(RetrySchedule::none()),
    ])?)
}

fn router(env: &TestEnv, hub: Arc<Hub>) -> Router {
    create_router(AppState::new(hub, env.clock()), Duration::from_secs(5))
}

fn publish_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Result<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn publish_enqueues_and_answers_no_content() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);
    let app = router(&env, hub.clone());

    let response = app.oneshot(publish_request(r#"{"type":"order.created","payload":{"id":1}}"#)).await?;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.headers().contains_key("x-request-id"));
    let queued = env.store().queued_envelopes("hub:outbound").await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].message_type.as_str(), "order.created");
    assert_eq!(queued[0].payload, json!({"id": 1}));
    assert_eq!(queued[0].attempt, 0);
    Ok(())
}

#[tokio::test]
async fn publish_without_payload_defaults_to_null() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);

    let response =
        router(&env, hub).oneshot(publish_request(r#"{"type":"order.created"}"#)).await?;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let queued = env.store().queued_envelopes("hub:outbound").await;
    assert_eq!(queued[0].payload, Value::Null);
    Ok(())
}

#[tokio::test]
async fn malformed_publish_is_unprocessable() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);

    for body in [r#"{"payload":{}}"#, r#"{"type":""}"#, "not json"] {
        let response = router(&env, hub.clone()).oneshot(publish_request(body)).await?;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        let error = json_body(response).await?;
        assert_eq!(error["error"]["code"], "invalid_message");
    }
    assert_eq!(env.store().count_items("hub:outbound").await?, 0);
    Ok(())
}

#[tokio::test]
async fn publish_while_store_unavailable_is_503() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);
    env.store().inject_unavailable("connection refused").await;

    let response =
        router(&env, hub).oneshot(publish_request(r#"{"type":"order.created"}"#)).await?;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let error = json_body(response).await?;
    assert_eq!(error["error"]["code"], "store_unavailable");
    Ok(())
}

#[tokio::test]
async fn health_reports_store_state() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);

    let response = router(&env, hub.clone()).oneshot(get("/health")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let health = json_body(response).await?;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["checks"]["store"]["status"], "up");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health["timestamp"].is_string());

    env.store().inject_unavailable("down for maintenance").await;
    let response = router(&env, hub).oneshot(get("/health")).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let health = json_body(response).await?;
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["checks"]["store"]["status"], "down");
    Ok(())
}

#[tokio::test]
async fn health_rejects_post() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);

    let request = Request::builder().method("POST").uri("/health").body(Body::empty())?;
    let response = router(&env, hub).oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    Ok(())
}

#[tokio::test]
async fn dead_letters_are_listed_after_failed_delivery() -> Result<()> {
    let env = TestEnv::new().await?;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/billing"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&env.server)
        .await;
    let hub = Arc::new(env.hub(manifest(&env)?)?);
    hub.start().await;

    let response = router(&env, hub.clone())
        .oneshot(publish_request(r#"{"type":"order.created","payload":{"id":9}}"#))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    env.wait_until(Duration::from_secs(5), || async {
        hub.dead_letters("billing", 10).await.ok().flatten().is_some_and(|r| !r.is_empty())
    })
    .await?;
    hub.shutdown().await?;

    let response =
        router(&env, hub.clone()).oneshot(get("/api/v1/services/billing/dead_letters?limit=5")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let records = json_body(response).await?;
    let records = records.as_array().cloned().unwrap_or_default();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["service"], "billing");
    assert_eq!(records[0]["envelope"]["payload"], json!({"id": 9}));
    assert_eq!(records[0]["attempts"], 1);
    Ok(())
}

#[tokio::test]
async fn dead_letters_of_unknown_service_is_404() -> Result<()> {
    let env = TestEnv::new().await?;
    let hub = Arc::new(env.hub(manifest(&env)?)?);

    for service in ["nobody", "orders"] {
        let uri = format!("/api/v1/services/{service}/dead_letters");
        let response = router(&env, hub.clone()).oneshot(get(&uri)).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    Ok(())
}
