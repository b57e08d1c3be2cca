//! Fraud review workflow and its front door.

pub mod result;
pub mod transaction;
pub mod workflow;

pub use result::{CustomerVerificationResult, ResultBody, ReviewDecision, WorkflowResult};
pub use transaction::{Transaction, TransactionRequest};
pub use workflow::{FraudReviewWorkflow, ReviewSettings, ReviewState, ReviewStep};

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::collaborators::{HttpScorer, Scorer, TracingNotifier, UnconfiguredScorer};
use crate::config::{FraudReviewConfig, StorageBackend};
use crate::engine::{
    CallbackToken, DeliveryOutcome, Engine, EngineResult, FileSystemStore, InvalidInputError,
    MemoryStore, RecoveryReport, RunId, RunSnapshot, RunStore,
};
use crate::observability::OperationTimer;

/// Snapshot of one fraud review run.
pub type ReviewSnapshot = RunSnapshot<WorkflowResult>;

/// Entry points of the fraud review service.
pub struct FraudReview {
    engine: Engine<FraudReviewWorkflow>,
}

impl FraudReview {
    /// Must be called inside a Tokio runtime.
    pub fn new(workflow: FraudReviewWorkflow, store: Arc<dyn RunStore>) -> Self {
        Self {
            engine: Engine::new(workflow, store),
        }
    }

    /// Build the service from configuration: store backend, scorer and
    /// workflow settings.
    pub async fn from_config(config: &FraudReviewConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn RunStore> = match config.storage.backend {
            StorageBackend::Filesystem => {
                Arc::new(FileSystemStore::open(&config.storage.directory).await?)
            }
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let scorer: Arc<dyn Scorer> = match &config.scorer.endpoint {
            Some(endpoint) => Arc::new(HttpScorer::new(
                endpoint.clone(),
                Duration::from_secs(config.scorer.request_timeout_seconds),
            )?),
            None => {
                warn!("No scoring endpoint configured; unscored transactions will be escalated");
                Arc::new(UnconfiguredScorer)
            }
        };

        let workflow = FraudReviewWorkflow::new(scorer, Arc::new(TracingNotifier), config.review_settings());
        info!(backend = ?config.storage.backend, "Fraud review service ready");
        Ok(Self::new(workflow, store))
    }

    /// Validate a transaction and start (or pick up) its review.
    pub async fn start(&self, request: TransactionRequest) -> EngineResult<ReviewSnapshot> {
        let transaction = request.validate().inspect_err(|e| {
            warn!(state = %ReviewState::Rejected, error = %e, "Transaction rejected");
        })?;
        self.engine.start(transaction).await
    }

    /// Same as `start`, for a transaction given as JSON.
    pub async fn start_json(&self, transaction: Value) -> EngineResult<ReviewSnapshot> {
        let request: TransactionRequest = serde_json::from_value(transaction)
            .map_err(|e| InvalidInputError::malformed(format!("malformed transaction: {e}")))?;
        self.start(request).await
    }

    /// Answer a verification callback.
    pub async fn deliver(&self, token: &CallbackToken, payload: Value) -> EngineResult<DeliveryOutcome> {
        self.engine.deliver_callback(token, payload).await
    }

    pub async fn status(&self, run_id: &RunId) -> EngineResult<ReviewSnapshot> {
        self.engine.snapshot(run_id).await
    }

    /// Rebuild callback timers and re-drive unfinished runs.
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let timer = OperationTimer::new("recover");
        let report = self.engine.recover().await?;
        timer.finish();
        Ok(report)
    }

    pub fn engine(&self) -> &Engine<FraudReviewWorkflow> {
        &self.engine
    }

    pub fn shutdown(&self) {
        self.engine.metrics().log_stats();
        self.engine.shutdown();
    }
}
