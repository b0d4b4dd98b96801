//! Integration tests for the control-plane HTTP contract.
//!
//! A wiremock server stands in for the control plane.

use std::time::Duration;

use edgecdn_edge_agent::client::{ControlPlaneClient, NodeStatus};
use edgecdn_edge_agent::config::Config;
use edgecdn_edge_agent::credentials::NodeIdentity;
use edgecdn_edge_agent::error::ClientError;
use rstest::rstest;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_client(server: &MockServer) -> ControlPlaneClient {
    let mut config = Config::from_lookup(&server.uri(), |_| None).unwrap();
    config.request_timeout = Duration::from_millis(500);
    ControlPlaneClient::new(&config).unwrap()
}

fn identity() -> NodeIdentity {
    NodeIdentity::new("abc-123")
}

#[rstest]
#[case(201)]
#[case(200)]
#[tokio::test]
async fn test_register_created_or_existing(#[case] status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register/"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "ip_address": "203.0.113.7",
            "status": "offline",
            "api_key": "abc-123"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity = test_client(&server).register().await.unwrap();
    assert_eq!(identity.as_str(), "abc-123");
}

#[tokio::test]
async fn test_register_without_api_key_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register/"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "ip_address": "203.0.113.7",
            "status": "offline"
        })))
        .mount(&server)
        .await;

    let err = test_client(&server).register().await.unwrap_err();
    assert!(matches!(err, ClientError::RegistrationFailed(_)));
}

#[tokio::test]
async fn test_register_server_error_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/register/"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "Could not determine IP address."
        })))
        .mount(&server)
        .await;

    let err = test_client(&server).register().await.unwrap_err();
    assert!(matches!(err, ClientError::RegistrationFailed(_)));
    assert!(err.to_string().contains("400"));
}

#[tokio::test]
async fn test_fetch_sends_api_key_and_parses_websites() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .and(header("Authorization", "ApiKey abc-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "websites": [
                {"domain": "b.example.com", "origin_server": "http://10.0.0.2:8080"},
                {"domain": "a.example.com", "origin_server": "http://10.0.0.1:8080"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let state = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap();

    let domains: Vec<_> = state.rules().map(|r| r.domain.clone()).collect();
    assert_eq!(domains, ["a.example.com", "b.example.com"]);
}

#[tokio::test]
async fn test_fetch_drops_invalid_rules() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "websites": [
                {"domain": "a.example.com", "origin_server": "http://10.0.0.1:8080"},
                {"domain": "evil.com; include /etc/passwd", "origin_server": "http://x"},
                {"domain": "c.example.com", "origin_server": "not-a-url"}
            ]
        })))
        .mount(&server)
        .await;

    let state = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap();
    assert_eq!(state.len(), 1);
}

#[rstest]
#[case(401)]
#[case(403)]
#[tokio::test]
async fn test_fetch_rejected_identity_is_auth_failure(#[case] status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(
            ResponseTemplate::new(status).set_body_json(json!({"detail": "Invalid API Key"})),
        )
        .mount(&server)
        .await;

    let err = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap_err();
    assert!(err.is_auth_failure(), "{status} should be an auth failure");
}

#[rstest]
#[case(404)]
#[case(500)]
#[case(502)]
#[case(503)]
#[tokio::test]
async fn test_fetch_other_errors_are_transient(#[case] status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;

    let err = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transient(_)), "{status}: {err}");
}

#[tokio::test]
async fn test_fetch_malformed_body_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sites": []})))
        .mount(&server)
        .await;

    let err = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transient(_)));
}

#[tokio::test]
async fn test_fetch_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"websites": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = test_client(&server)
        .fetch_desired_state(&identity())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transient(_)));
}

#[tokio::test]
async fn test_fetch_unreachable_is_transient() {
    let server = MockServer::start().await;
    let client = test_client(&server);
    drop(server);

    let err = client.fetch_desired_state(&identity()).await.unwrap_err();
    assert!(matches!(err, ClientError::Transient(_)));
}

#[tokio::test]
async fn test_report_status_posts_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/config/"))
        .and(header("Authorization", "ApiKey abc-123"))
        .and(body_json(json!({"status": "offline"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Status updated to offline"
        })))
        .expect(1)
        .mount(&server)
        .await;

    test_client(&server)
        .report_status(&identity(), NodeStatus::Offline)
        .await
        .unwrap();
}
