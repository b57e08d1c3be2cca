// Shared fakes and helpers for fraud review integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use fraud_review::engine::ParallelConfig;
use fraud_review::{
    CallbackToken, CollaboratorError, FraudReview, FraudReviewWorkflow, RetryPolicy, ReviewSettings,
    ReviewSnapshot, RunId, RunStore, ScoreRequest, Scorer, Transaction, VerificationChannel,
};
use fraud_review::{ErrorKind, Notifier};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Scorer answering from a script; the last answer repeats.
pub struct ScriptedScorer {
    script: Mutex<VecDeque<Result<i64, CollaboratorError>>>,
    last: Mutex<Result<i64, CollaboratorError>>,
    calls: AtomicU32,
}

impl ScriptedScorer {
    pub fn always(score: i64) -> Arc<Self> {
        Self::script(vec![Ok(score)])
    }

    pub fn failing(error: CollaboratorError) -> Arc<Self> {
        Self::script(vec![Err(error)])
    }

    pub fn script(answers: Vec<Result<i64, CollaboratorError>>) -> Arc<Self> {
        let last = answers
            .last()
            .cloned()
            .unwrap_or_else(|| Err(CollaboratorError::unavailable("empty script")));
        Arc::new(Self {
            script: Mutex::new(answers.into()),
            last: Mutex::new(last),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score(&self, _request: &ScoreRequest) -> Result<i64, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.last.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentPrompt {
    pub channel: VerificationChannel,
    pub transaction_id: i64,
    pub token: CallbackToken,
}

/// Notifier remembering every prompt it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentPrompt>>,
    fail_with: Mutex<Option<ErrorKind>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(kind: ErrorKind) -> Arc<Self> {
        let notifier = Self::default();
        *notifier.fail_with.lock().unwrap() = Some(kind);
        Arc::new(notifier)
    }

    pub fn sent(&self) -> Vec<SentPrompt> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn token_for(&self, channel: VerificationChannel) -> CallbackToken {
        self.sent()
            .into_iter()
            .find(|p| p.channel == channel)
            .map(|p| p.token)
            .expect("no prompt sent on channel")
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        channel: VerificationChannel,
        transaction: &Transaction,
        callback_token: &CallbackToken,
    ) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(SentPrompt {
            channel,
            transaction_id: transaction.id,
            token: callback_token.clone(),
        });
        match *self.fail_with.lock().unwrap() {
            Some(kind) => Err(CollaboratorError::new(kind, "notifier down")),
            None => Ok(()),
        }
    }
}

/// Production thresholds with millisecond retry delays.
pub fn fast_settings() -> ReviewSettings {
    ReviewSettings {
        low_threshold: 3,
        high_threshold: 5,
        max_escalation_score: 5,
        verification_timeout: DAY,
        verification: ParallelConfig::new(1, 1, 2),
        scorer_retry: RetryPolicy::transient(3)
            .with_retryable(ErrorKind::MissingField)
            .with_base_delay(Duration::from_millis(1)),
        notifier_retry: RetryPolicy::transient(3).with_base_delay(Duration::from_millis(1)),
    }
}

pub fn review_with(
    store: Arc<dyn RunStore>,
    scorer: Arc<dyn Scorer>,
    notifier: Arc<dyn Notifier>,
) -> FraudReview {
    FraudReview::new(FraudReviewWorkflow::new(scorer, notifier, fast_settings()), store)
}

pub fn transaction(id: i64, amount: f64, location: &str, vendor: &str, score: i64) -> Value {
    json!({
        "id": id,
        "amount": amount,
        "location": location,
        "vendor": vendor,
        "score": score
    })
}

pub fn run_id(transaction_id: i64) -> RunId {
    RunId::new(format!("fraud-review-{transaction_id}"))
}

/// Poll until the run is terminal.
pub async fn wait_for_completion(review: &FraudReview, run_id: &RunId) -> ReviewSnapshot {
    for _ in 0..500 {
        let snapshot = review.status(run_id).await.unwrap();
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

/// Poll until `step` is in the run's ledger.
pub async fn wait_for_step(review: &FraudReview, run_id: &RunId, step: &str) -> ReviewSnapshot {
    for _ in 0..500 {
        let snapshot = review.status(run_id).await.unwrap();
        if snapshot.steps.iter().any(|s| s.step_name == step) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("step {step} never recorded for run {run_id}");
}

pub fn has_step(snapshot: &ReviewSnapshot, prefix: &str) -> bool {
    snapshot.steps.iter().any(|s| s.step_name.starts_with(prefix))
}
