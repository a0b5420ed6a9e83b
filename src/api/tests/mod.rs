use super::*;
use crate::Config;
use crate::broker::MemoryBroker;
use crate::test_helpers::{FakeConnector, NoRefresh, miner_config};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::time::Duration;
use tower::ServiceExt;


/// Miner over a fake mail server, with its config for the router
fn create_test_miner(connector: &FakeConnector) -> (Arc<MailboxMiner>, Arc<Config>) {
    create_test_miner_with(connector, miner_config(false))
}

fn create_test_miner_with(connector: &FakeConnector, config: Config) -> (Arc<MailboxMiner>, Arc<Config>) {
    let miner = MailboxMiner::new(
        config,
        Arc::new(MemoryBroker::new()),
        Arc::new(connector.clone()),
        Arc::new(NoRefresh),
    )
    .unwrap();
    let config = miner.get_config();
    (Arc::new(miner), config)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_api_server_spawns() {
    let connector = FakeConnector::new();
    let mut config = miner_config(false);
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let (miner, config) = create_test_miner_with(&connector, config);

    let api_handle = tokio::spawn(async move { start_api_server(miner, config).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!api_handle.is_finished(), "server should still be serving");
    api_handle.abort();
}

#[tokio::test]
async fn test_spawn_api_server_method() {
    let connector = FakeConnector::new();
    let mut config = miner_config(false);
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let (miner, _config) = create_test_miner_with(&connector, config);

    let api_handle = miner.spawn_api_server();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!api_handle.is_finished());
    api_handle.abort();
}

#[tokio::test]
async fn test_cors_enabled() {
    let connector = FakeConnector::new();
    let mut config = miner_config(false);
    config.api.cors_enabled = true;
    config.api.cors_origins = vec!["*".to_string()];
    let (miner, config) = create_test_miner_with(&connector, config);
    let app = create_router(miner, config);

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers().contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_cors_disabled() {
    let connector = FakeConnector::new();
    let mut config = miner_config(false);
    config.api.cors_enabled = false;
    let (miner, config) = create_test_miner_with(&connector, config);
    let app = create_router(miner, config);

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn api_key_guards_every_route() {
    let connector = FakeConnector::new();
    let mut config = miner_config(false);
    config.api.api_key = Some("secret".to_string());
    let (miner, config) = create_test_miner_with(&connector, config);
    let app = create_router(miner, config);

    let denied = app
        .clone()
        .oneshot(Request::builder().uri("/mine/abc").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(denied).await["code"], "unauthorized");

    let allowed = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("X-Api-Key", "secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}
