use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::CollaboratorError;
use crate::review::Transaction;

/// Valid risk scores returned by the scoring model.
pub const RISK_SCORE_RANGE: RangeInclusive<i64> = 1..=5;

/// Fields sent to the scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub amount: f64,
    pub location: String,
    pub vendor: String,
}

impl From<&Transaction> for ScoreRequest {
    fn from(transaction: &Transaction) -> Self {
        Self {
            amount: transaction.amount,
            location: transaction.location.clone(),
            vendor: transaction.vendor.clone(),
        }
    }
}

/// Risk scoring collaborator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Risk score in 1..=5 for the request.
    async fn score(&self, request: &ScoreRequest) -> Result<i64, CollaboratorError>;
}

/// Extract `output.risk_score` from a scoring response.
pub fn parse_risk_score(response: &Value) -> Result<i64, CollaboratorError> {
    let raw = match response.pointer("/output/risk_score") {
        None | Some(Value::Null) => {
            return Err(CollaboratorError::missing_field(
                "scoring response has no output.risk_score",
            ))
        }
        Some(raw) => raw,
    };

    let score = raw.as_i64().ok_or_else(|| {
        CollaboratorError::invalid_response(format!("risk_score {raw} is not an integer"))
    })?;

    if !RISK_SCORE_RANGE.contains(&score) {
        return Err(CollaboratorError::invalid_response(format!(
            "risk_score {score} is outside {}..={}",
            RISK_SCORE_RANGE.start(),
            RISK_SCORE_RANGE.end()
        )));
    }

    Ok(score)
}

/// Scorer backed by an HTTP inference endpoint.
#[derive(Debug, Clone)]
pub struct HttpScorer {
    client: Client,
    endpoint: String,
}

impl HttpScorer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_transport_error(error: reqwest::Error) -> CollaboratorError {
    if error.is_timeout() {
        CollaboratorError::timeout(error.to_string())
    } else if error.is_decode() {
        CollaboratorError::invalid_response(error.to_string())
    } else {
        CollaboratorError::connection(error.to_string())
    }
}

fn classify_status(status: StatusCode) -> CollaboratorError {
    let message = format!("scoring endpoint answered {status}");
    if status == StatusCode::REQUEST_TIMEOUT {
        CollaboratorError::timeout(message)
    } else if status.is_server_error() {
        CollaboratorError::connection(message)
    } else {
        CollaboratorError::rejected(message)
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<i64, CollaboratorError> {
        debug!(endpoint = %self.endpoint, vendor = %request.vendor, "Requesting risk score");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "input": request }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint = %self.endpoint, %status, "Scoring endpoint returned an error status");
            return Err(classify_status(status));
        }

        let body: Value = response.json().await.map_err(classify_transport_error)?;
        parse_risk_score(&body)
    }
}

/// Stand-in used when no scoring endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredScorer;

#[async_trait]
impl Scorer for UnconfiguredScorer {
    async fn score(&self, _request: &ScoreRequest) -> Result<i64, CollaboratorError> {
        Err(CollaboratorError::unavailable("no scoring endpoint configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorKind;

    #[test]
    fn test_parse_risk_score_accepts_valid_scores() {
        for score in 1..=5 {
            let response = json!({"output": {"risk_score": score}});
            assert_eq!(parse_risk_score(&response).unwrap(), score);
        }
    }

    #[test]
    fn test_missing_score_is_missing_field() {
        for response in [json!({}), json!({"output": {}}), json!({"output": {"risk_score": null}})] {
            let err = parse_risk_score(&response).unwrap_err();
            assert_eq!(err.kind, ErrorKind::MissingField);
        }
    }

    #[test]
    fn test_malformed_score_is_invalid_response() {
        for response in [
            json!({"output": {"risk_score": 4.5}}),
            json!({"output": {"risk_score": "4"}}),
            json!({"output": {"risk_score": 0}}),
            json!({"output": {"risk_score": 9}}),
        ] {
            let err = parse_risk_score(&response).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidResponse, "{response}");
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY).kind, ErrorKind::Connection);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT).kind, ErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::FORBIDDEN).kind, ErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_unconfigured_scorer_is_unavailable() {
        let request = ScoreRequest {
            amount: 10.0,
            location: "Portland".to_string(),
            vendor: "Coffee Shop".to_string(),
        };
        let err = UnconfiguredScorer.score(&request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }
}
