// HttpScorer against a mock inference endpoint

mod common;

use common::*;
use fraud_review::{
    ErrorKind, HttpScorer, MemoryStore, ReviewDecision, ScoreRequest, Scorer,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> ScoreRequest {
    ScoreRequest {
        amount: 6500.0,
        location: "Los Angeles".to_string(),
        vendor: "Electronics Store".to_string(),
    }
}

async fn scorer(server: &MockServer) -> HttpScorer {
    HttpScorer::new(format!("{}/invocations", server.uri()), Duration::from_millis(200)).unwrap()
}

#[tokio::test]
async fn posts_transaction_fields_and_reads_risk_score() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/invocations"))
        .and(body_json(json!({
            "input": {"amount": 6500.0, "location": "Los Angeles", "vendor": "Electronics Store"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {"risk_score": 5}})))
        .expect(1)
        .mount(&server)
        .await;

    let score = scorer(&server).await.score(&request()).await.unwrap();
    assert_eq!(score, 5);
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = scorer(&server).await.score(&request()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Connection);
    assert!(err.is_transient());
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = scorer(&server).await.score(&request()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Rejected);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"output": {"risk_score": 2}}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = scorer(&server).await.score(&request()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn response_without_score_is_missing_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {}})))
        .mount(&server)
        .await;

    let err = scorer(&server).await.score(&request()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::MissingField);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let scorer = HttpScorer::new("http://127.0.0.1:1/invocations", Duration::from_millis(200)).unwrap();

    let err = scorer.score(&request()).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test]
async fn review_retries_a_flaky_scorer_before_deciding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {"risk_score": 5}})))
        .expect(1)
        .mount(&server)
        .await;

    let review = review_with(
        Arc::new(MemoryStore::new()),
        Arc::new(scorer(&server).await),
        RecordingNotifier::new(),
    );
    let result = review
        .start_json(transaction(3, 6500.0, "Los Angeles", "Electronics Store", 0))
        .await
        .unwrap()
        .result
        .unwrap();

    assert_eq!(result.decision(), ReviewDecision::SentToFraudDept);
    assert_eq!(result.body.fraud_score, Some(5));
}

#[tokio::test]
async fn out_of_range_score_escalates_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": {"risk_score": 0}})))
        .expect(1)
        .mount(&server)
        .await;

    let review = review_with(
        Arc::new(MemoryStore::new()),
        Arc::new(scorer(&server).await),
        RecordingNotifier::new(),
    );
    let result = review
        .start_json(transaction(7, 45.0, "Portland", "Coffee Shop", 0))
        .await
        .unwrap()
        .result
        .unwrap();

    assert_eq!(result.decision(), ReviewDecision::SentToFraudDept);
    assert_eq!(result.body.fraud_score, Some(5));
}
