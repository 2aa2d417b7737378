use std::sync::Arc;
use std::time::Duration;

use mentorchat::api::{
    cancellation_pair, to_api_history, CompletionApi, CompletionClient, CompletionError,
    IncompleteReason, RetryPolicy, MAX_HISTORY_LEN,
};
use mentorchat::config::{Credentials, EngineConfig};
use mentorchat::models::Message;
use mentorchat::persona::Persona;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer) -> EngineConfig {
    EngineConfig {
        endpoint: format!("{}/chat/completions", server.uri()),
        model: "mentor-large".to_string(),
        api_key_ref: None,
        persona: Persona::Mentor,
    }
}

fn test_credentials() -> Credentials {
    Credentials {
        override_key: None,
        default_key: Some("test-key".to_string()),
    }
}

// Keeps retry tests fast; the production defaults wait seconds per attempt.
fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_backoff: Duration::from_millis(10),
        jitter_cap_ms: 0,
    }
}

fn success_body(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"content": content}, "finish_reason": "stop"}]
    }))
}

#[tokio::test]
async fn sends_expected_payload_and_returns_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "mentor-large",
            "temperature": 0.7,
            "stream": false
        })))
        .respond_with(success_body("hello"))
        .expect(1)
        .mount(&server)
        .await;

    let client = CompletionClient::new(&test_config(&server), test_credentials());
    let result = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap();
    assert_eq!(result, "hello");
}

#[tokio::test]
async fn history_is_truncated_to_the_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(success_body("ok"))
        .mount(&server)
        .await;

    let mut messages = Vec::new();
    for i in 0..10 {
        messages.push(Message::user(format!("q{}", i)));
        messages.push(Message::assistant(format!("a{}", i)));
    }
    let history = to_api_history(&messages);

    let client = CompletionClient::new(&test_config(&server), test_credentials());
    client
        .send(&history, "latest", None, Persona::Mentor, None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let sent = body["messages"].as_array().unwrap();

    // system + truncated history + new user message
    assert_eq!(sent.len(), MAX_HISTORY_LEN + 2);
    assert_eq!(sent[0]["role"], "system");
    assert_eq!(sent[1]["content"], "q8"); // oldest surviving entry
    assert_eq!(sent.last().unwrap()["content"], "latest");
    assert_eq!(sent.last().unwrap()["role"], "user");
}

#[tokio::test]
async fn system_prompt_override_takes_precedence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(success_body("ok"))
        .mount(&server)
        .await;

    let client = CompletionClient::new(&test_config(&server), test_credentials());
    client
        .send(&[], "hi", None, Persona::Adversary, Some("You are a test harness."))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["messages"][0]["content"], "You are a test harness.");
}

#[tokio::test]
async fn transient_500s_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(success_body("recovered"))
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let result = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap();

    assert_eq!(result, "recovered");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn persistent_429_exhausts_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(err, CompletionError::RateLimited);
}

#[tokio::test]
async fn retry_after_header_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(success_body("after the wait"))
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let result = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap();
    assert_eq!(result, "after the wait");
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();

    assert_eq!(err, CompletionError::InvalidApiKey);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unexpected_status_maps_to_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(418)
                .set_body_json(json!({"error": {"message": "teapot refuses"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CompletionError::Api {
            status: 418,
            message: "teapot refuses".to_string()
        }
    );
}

#[tokio::test]
async fn empty_content_surfaces_finish_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": ""}, "finish_reason": "length"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        CompletionClient::with_retry_policy(&test_config(&server), test_credentials(), fast_retry());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CompletionError::Incomplete(IncompleteReason::Truncated)
    );
}

#[tokio::test]
async fn missing_credential_makes_no_network_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(success_body("unused"))
        .expect(0)
        .mount(&server)
        .await;

    let client = CompletionClient::new(&test_config(&server), Credentials::default());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(err, CompletionError::MissingApiKey);
}

#[tokio::test]
async fn unreachable_endpoint_exhausts_to_network_error() {
    let config = EngineConfig {
        // Nothing listens here; connections are refused immediately.
        endpoint: "http://127.0.0.1:9".to_string(),
        model: "mentor-large".to_string(),
        api_key_ref: None,
        persona: Persona::Mentor,
    };
    let client = CompletionClient::with_retry_policy(&config, test_credentials(), fast_retry());
    let err = client
        .send(&[], "hi", None, Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(err, CompletionError::NetworkUnreachable);
}

#[tokio::test]
async fn pre_signalled_cancellation_skips_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(success_body("unused"))
        .expect(0)
        .mount(&server)
        .await;

    let (handle, token) = cancellation_pair();
    handle.cancel();

    let client = CompletionClient::new(&test_config(&server), test_credentials());
    let err = client
        .send(&[], "hi", Some(token), Persona::Mentor, None)
        .await
        .unwrap_err();
    assert_eq!(err, CompletionError::Cancelled);
}

#[tokio::test]
async fn cancellation_interrupts_a_slow_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(success_body("too late").set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let (handle, token) = cancellation_pair();
    let client = Arc::new(CompletionClient::new(&test_config(&server), test_credentials()));

    let task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send(&[], "hi", Some(token), Persona::Mentor, None)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, CompletionError::Cancelled);
}
