use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::ErrorKind;

/// Identifier of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation token handed to an external party so it can resolve a waiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(pub String);

impl CallbackToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Durable header of a workflow run. The step history lives in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub workflow: String,
    pub input: Value,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(run_id: RunId, workflow: &str, input: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            workflow: workflow.to_string(),
            input,
            status: RunStatus::Running,
            result: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Outcome of one step invocation as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { value: Value },
    Failure { kind: ErrorKind, message: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

/// One append-only ledger entry. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub attempt: u32,
    pub input_hash: String,
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn success(step_name: impl Into<String>, attempt: u32, input_hash: String, value: Value) -> Self {
        Self {
            step_name: step_name.into(),
            attempt,
            input_hash,
            outcome: StepOutcome::Success { value },
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        step_name: impl Into<String>,
        attempt: u32,
        input_hash: String,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            attempt,
            input_hash,
            outcome: StepOutcome::Failure {
                kind,
                message: message.into(),
            },
            timestamp: Utc::now(),
        }
    }
}

/// Resolution state of a callback waiter. Exactly one transition out of
/// `Pending` is permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WaiterResolution {
    Pending,
    Delivered { payload: Value },
    TimedOut,
}

impl WaiterResolution {
    pub fn is_pending(&self) -> bool {
        matches!(self, WaiterResolution::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackWaiter {
    pub callback_token: CallbackToken,
    pub run_id: RunId,
    /// Scope of the branch that registered the waiter; empty for the run root.
    pub branch_id: String,
    pub registered_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub resolution: WaiterResolution,
}

/// What a workflow observes once a waiter is no longer pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum CallbackResolution {
    Delivered { payload: Value },
    TimedOut,
}

/// Stable hex digest of any serializable value.
pub fn content_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_content_hash_is_stable_for_equal_values() {
        let a = content_hash(&json!({"amount": 45.0, "vendor": "Coffee Shop"}));
        let b = content_hash(&json!({"amount": 45.0, "vendor": "Coffee Shop"}));
        let c = content_hash(&json!({"amount": 46.0, "vendor": "Coffee Shop"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_step_record_serialization_shape() {
        let record = StepRecord::failure("fraud-check", 3, "h".into(), ErrorKind::Timeout, "slow");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"]["status"], "failure");
        assert_eq!(value["outcome"]["kind"], "timeout");
        assert_eq!(value["attempt"], 3);
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        assert_ne!(CallbackToken::generate(), CallbackToken::generate());
    }
}
