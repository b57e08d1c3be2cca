use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{DuplicateStepError, EngineError, EngineResult};
use super::store::RunStore;
use super::types::{RunId, StepOutcome, StepRecord};

#[derive(Debug, Default)]
struct LedgerState {
    records: Vec<StepRecord>,
    /// Step name to the index of its latest record.
    index: HashMap<String, usize>,
}

impl LedgerState {
    fn push(&mut self, record: StepRecord) {
        self.index.insert(record.step_name.clone(), self.records.len());
        self.records.push(record);
    }
}

/// Append-only record of one run's step outcomes.
///
/// Writes go to the store before they become visible to lookups, so a
/// memoized outcome is always a durable one.
pub struct StepLedger {
    run_id: RunId,
    store: Arc<dyn RunStore>,
    state: Mutex<LedgerState>,
}

impl StepLedger {
    /// Load the existing ledger for `run_id` (empty for a new run).
    pub async fn open(run_id: RunId, store: Arc<dyn RunStore>) -> EngineResult<Self> {
        let mut state = LedgerState::default();
        for record in store.read_steps(&run_id).await? {
            state.push(record);
        }
        debug!(run_id = %run_id, steps = state.records.len(), "Ledger opened");

        Ok(Self {
            run_id,
            store,
            state: Mutex::new(state),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn lookup(&self, step_name: &str) -> Option<StepOutcome> {
        self.lookup_record(step_name).await.map(|record| record.outcome)
    }

    pub async fn lookup_record(&self, step_name: &str) -> Option<StepRecord> {
        let state = self.state.lock().await;
        state
            .index
            .get(step_name)
            .map(|&idx| state.records[idx].clone())
    }

    pub async fn contains(&self, step_name: &str) -> bool {
        self.state.lock().await.index.contains_key(step_name)
    }

    /// All records in append order.
    pub async fn records(&self) -> Vec<StepRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Durably append `record`.
    ///
    /// Fails with `DuplicateStep` if the step name already has a recorded
    /// success. The lock is held across the store write so appends within a
    /// run are totally ordered.
    pub async fn append(&self, record: StepRecord) -> EngineResult<()> {
        let mut state = self.state.lock().await;

        let already_succeeded = state
            .index
            .get(&record.step_name)
            .is_some_and(|&idx| state.records[idx].outcome.is_success());
        if already_succeeded {
            return Err(EngineError::DuplicateStep(DuplicateStepError {
                run_id: self.run_id.clone(),
                step_name: record.step_name,
            }));
        }

        self.store.append_step(&self.run_id, &record).await?;
        debug!(
            run_id = %self.run_id,
            step = %record.step_name,
            attempt = record.attempt,
            success = record.outcome.is_success(),
            "Step recorded"
        );
        state.push(record);
        Ok(())
    }
}

impl std::fmt::Debug for StepLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLedger")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}
