use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{CollaboratorError, EngineError, EngineResult};
use super::ledger::StepLedger;
use super::retry::RetryPolicy;
use super::types::{content_hash, StepOutcome, StepRecord};
use crate::observability::EngineMetrics;

/// A named unit of work with its retry policy.
///
/// The input is hashed into the ledger record so a replay against a changed
/// input can be detected.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    pub retry_policy: RetryPolicy,
    pub input: Value,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::no_retry(),
            input: Value::Null,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_input(mut self, input: &impl Serialize) -> EngineResult<Self> {
        self.input = serde_json::to_value(input).map_err(|source| EngineError::StepSerialization {
            step_name: self.name.clone(),
            source,
        })?;
        Ok(self)
    }

    /// Same definition under a different (scoped) name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Runs steps against a ledger with memoization and retries.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    metrics: Arc<EngineMetrics>,
}

impl StepExecutor {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Execute `step` once-effectively.
    ///
    /// A recorded outcome for the step name is returned without calling `f`.
    /// Otherwise `f` is called with the 1-based attempt number until it
    /// succeeds or the retry policy gives up. Either way the final outcome is
    /// appended to the ledger before this returns.
    pub async fn execute<T, F, Fut>(
        &self,
        ledger: &StepLedger,
        step: &StepDefinition,
        mut f: F,
    ) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let input_hash = content_hash(&step.input);

        if let Some(record) = ledger.lookup_record(&step.name).await {
            if record.input_hash != input_hash {
                warn!(
                    run_id = %ledger.run_id(),
                    step = %step.name,
                    "Replayed step input differs from the recorded input"
                );
            }
            self.metrics.record_step_replayed();
            return replay_outcome(&step.name, record.outcome);
        }

        let mut attempt = 1;
        loop {
            self.metrics.record_step_executed();
            match f(attempt).await {
                Ok(value) => {
                    let json = serde_json::to_value(&value).map_err(|source| {
                        EngineError::StepSerialization {
                            step_name: step.name.clone(),
                            source,
                        }
                    })?;
                    ledger
                        .append(StepRecord::success(&step.name, attempt, input_hash, json))
                        .await?;
                    debug!(run_id = %ledger.run_id(), step = %step.name, attempt, "Step succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    let decision = step.retry_policy.should_retry(err.kind, attempt);
                    if decision.retry {
                        warn!(
                            run_id = %ledger.run_id(),
                            step = %step.name,
                            attempt,
                            error = %err,
                            delay_ms = decision.delay.as_millis() as u64,
                            "Step failed, retrying"
                        );
                        self.metrics.record_retry();
                        tokio::time::sleep(decision.delay).await;
                        attempt += 1;
                        continue;
                    }

                    error!(
                        run_id = %ledger.run_id(),
                        step = %step.name,
                        attempt,
                        error = %err,
                        "Step failed permanently"
                    );
                    ledger
                        .append(StepRecord::failure(
                            &step.name,
                            attempt,
                            input_hash,
                            err.kind,
                            err.message.clone(),
                        ))
                        .await?;
                    self.metrics.record_step_failure();
                    return Err(EngineError::StepFailedPermanently {
                        step_name: step.name.clone(),
                        last_error: err,
                    });
                }
            }
        }
    }

    /// Record the value produced by an engine-internal operation under
    /// `step_name`, or return the value recorded by an earlier drive.
    pub async fn memoize<T, F, Fut>(&self, ledger: &StepLedger, step_name: &str, f: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if let Some(StepOutcome::Success { value }) = ledger.lookup(step_name).await {
            self.metrics.record_step_replayed();
            return decode(step_name, value);
        }

        let value = f().await?;
        let json = serde_json::to_value(&value).map_err(|source| EngineError::StepSerialization {
            step_name: step_name.to_string(),
            source,
        })?;
        ledger
            .append(StepRecord::success(step_name, 1, content_hash(&Value::Null), json))
            .await?;
        info!(run_id = %ledger.run_id(), step = %step_name, "Recorded engine step");
        Ok(value)
    }
}

fn replay_outcome<T: DeserializeOwned>(step_name: &str, outcome: StepOutcome) -> EngineResult<T> {
    match outcome {
        StepOutcome::Success { value } => decode(step_name, value),
        StepOutcome::Failure { kind, message } => Err(EngineError::StepFailedPermanently {
            step_name: step_name.to_string(),
            last_error: CollaboratorError::new(kind, message),
        }),
    }
}

fn decode<T: DeserializeOwned>(step_name: &str, value: Value) -> EngineResult<T> {
    serde_json::from_value(value).map_err(|source| EngineError::StepSerialization {
        step_name: step_name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ErrorKind;
    use crate::engine::store::MemoryStore;
    use crate::engine::types::RunId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn setup() -> (StepExecutor, StepLedger) {
        let ledger = StepLedger::open(RunId::new("run-1"), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        (StepExecutor::new(Arc::new(EngineMetrics::new())), ledger)
    }

    #[tokio::test]
    async fn test_success_is_memoized() {
        let (executor, ledger) = setup().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let step = StepDefinition::new("fraud-check");

        for _ in 0..3 {
            let score: i64 = executor
                .execute(&ledger, &step, move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(4)
                })
                .await
                .unwrap();
            assert_eq!(score, 4);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.metrics().get_stats().steps_replayed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (executor, ledger) = setup().await;
        let step = StepDefinition::new("fraud-check").with_retry(RetryPolicy::transient(3));

        let value: String = executor
            .execute(&ledger, &step, |attempt| async move {
                if attempt < 3 {
                    Err(CollaboratorError::connection("refused"))
                } else {
                    Ok(format!("attempt-{attempt}"))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "attempt-3");
        let record = ledger.lookup_record("fraud-check").await.unwrap();
        assert_eq!(record.attempt, 3);
        assert_eq!(executor.metrics().get_stats().step_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_records_failure_and_replays_it() {
        let (executor, ledger) = setup().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let step = StepDefinition::new("notify").with_retry(
            RetryPolicy::transient(3).with_base_delay(Duration::from_millis(10)),
        );

        let err = executor
            .execute::<(), _, _>(&ledger, &step, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CollaboratorError::timeout("no answer"))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::StepFailedPermanently { ref last_error, .. } if last_error.kind == ErrorKind::Timeout
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let replayed = executor
            .execute::<(), _, _>(&ledger, &step, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(replayed.is_branch_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let (executor, ledger) = setup().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let step = StepDefinition::new("fraud-check").with_retry(RetryPolicy::transient(5));

        let result = executor
            .execute::<i64, _, _>(&ledger, &step, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CollaboratorError::invalid_response("risk_score was 9"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = ledger.lookup_record("fraud-check").await.unwrap();
        assert_eq!(record.attempt, 1);
    }

    #[tokio::test]
    async fn test_memoize_runs_once() {
        let (executor, ledger) = setup().await;
        let calls = AtomicU32::new(0);
        let counter = &calls;

        for _ in 0..2 {
            let token: String = executor
                .memoize(&ledger, "register", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("token-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(token, "token-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unserializable_input_is_an_error() {
        let mut input = std::collections::BTreeMap::new();
        input.insert(vec![1u8], 1u8);

        let err = StepDefinition::new("fraud-check").with_input(&input).unwrap_err();
        match err {
            EngineError::StepSerialization { step_name, .. } => assert_eq!(step_name, "fraud-check"),
            other => panic!("unexpected error {other:?}"),
        }

        let step = StepDefinition::new("fraud-check").with_input(&7).unwrap();
        assert_eq!(step.input, serde_json::json!(7));
    }
}
