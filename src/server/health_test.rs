//! Probe and scrape endpoint tests against a live listener

use super::*;
use std::time::Duration;

/// Poll /healthz until the server accepts connections
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

fn spawn_server(
    port: u16,
    readiness: &ReadinessState,
    metrics: &SharedMetrics,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let readiness = readiness.clone();
    let metrics = metrics.clone();
    tokio::spawn(async move { run_health_server(port, readiness, metrics).await })
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server")
}

#[tokio::test]
async fn test_healthz_returns_200() {
    // ARRANGE
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    let port = 18080;
    let server = spawn_server(port, &readiness, &metrics);
    let client = wait_for_server(port, 10).await;

    // ACT
    let response = get(&client, port, "/healthz").await;

    // ASSERT: liveness does not depend on readiness
    assert_eq!(response.status(), 200);

    server.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    // ARRANGE
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    let port = 18081;
    let server = spawn_server(port, &readiness, &metrics);
    let client = wait_for_server(port, 10).await;

    // ACT + ASSERT: not ready until the controller starts
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    readiness.set_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 200);

    // Shutdown flips it back
    readiness.set_not_ready();
    assert_eq!(get(&client, port, "/readyz").await.status(), 503);

    server.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_renders_registry() {
    // ARRANGE
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    metrics.record_reconciliation("success", 0.01);
    metrics.record_promotion();
    let port = 18082;
    let server = spawn_server(port, &readiness, &metrics);
    let client = wait_for_server(port, 10).await;

    // ACT
    let response = get(&client, port, "/metrics").await;

    // ASSERT
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = response.text().await.unwrap();
    assert!(body.contains("dataplane_reconciliations_total{result=\"success\"} 1"));
    assert!(body.contains("dataplane_promotions_total 1"));

    server.abort();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().unwrap();
    let port = 18083;
    let first = spawn_server(port, &readiness, &metrics);
    wait_for_server(port, 10).await;

    let second = run_health_server(port, readiness.clone(), metrics.clone()).await;

    assert!(second.is_err(), "second listener on the same port should fail");
    first.abort();
}

#[test]
fn test_readiness_state_is_shared_between_clones() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    let cloned = state.clone();
    state.set_ready();
    assert!(cloned.is_ready());

    cloned.set_not_ready();
    assert!(!state.is_ready());
}
