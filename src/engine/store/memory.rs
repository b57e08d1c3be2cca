use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{RunStore, WaiterTransition};
use crate::engine::error::PersistenceError;
use crate::engine::types::{
    CallbackToken, CallbackWaiter, RunId, StepRecord, WaiterResolution, WorkflowRun,
};

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, WorkflowRun>,
    archived: HashSet<RunId>,
    steps: HashMap<RunId, Vec<StepRecord>>,
    waiters: HashMap<CallbackToken, CallbackWaiter>,
}

/// In-process store. Two engines sharing one `Arc<MemoryStore>` behave like
/// a process restart against the same durable state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `PersistenceError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_archived(&self, run_id: &RunId) -> bool {
        self.tables
            .lock()
            .map(|tables| tables.archived.contains(run_id))
            .unwrap_or(false)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                reason: "memory store switched off".to_string(),
            });
        }
        self.tables.lock().map_err(|_| PersistenceError::StateCorruption {
            reason: "memory store lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), PersistenceError> {
        self.tables()?.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, PersistenceError> {
        Ok(self.tables()?.runs.get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>, PersistenceError> {
        let tables = self.tables()?;
        let mut runs: Vec<WorkflowRun> = tables
            .runs
            .values()
            .filter(|run| !tables.archived.contains(&run.run_id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    async fn archive_run(&self, run_id: &RunId) -> Result<(), PersistenceError> {
        let mut tables = self.tables()?;
        if !tables.runs.contains_key(run_id) {
            return Err(PersistenceError::StateCorruption {
                reason: format!("cannot archive unknown run {run_id}"),
            });
        }
        tables.archived.insert(run_id.clone());
        Ok(())
    }

    async fn append_step(&self, run_id: &RunId, record: &StepRecord) -> Result<(), PersistenceError> {
        self.tables()?
            .steps
            .entry(run_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, PersistenceError> {
        Ok(self.tables()?.steps.get(run_id).cloned().unwrap_or_default())
    }

    async fn save_waiter(&self, waiter: &CallbackWaiter) -> Result<(), PersistenceError> {
        self.tables()?
            .waiters
            .insert(waiter.callback_token.clone(), waiter.clone());
        Ok(())
    }

    async fn resolve_waiter(
        &self,
        token: &CallbackToken,
        resolution: &WaiterResolution,
    ) -> Result<WaiterTransition, PersistenceError> {
        let mut tables = self.tables()?;
        let Some(waiter) = tables.waiters.get_mut(token) else {
            return Ok(WaiterTransition::Missing);
        };
        if !waiter.resolution.is_pending() {
            return Ok(WaiterTransition::AlreadyResolved(waiter.clone()));
        }
        waiter.resolution = resolution.clone();
        Ok(WaiterTransition::Applied(waiter.clone()))
    }

    async fn load_waiter(
        &self,
        token: &CallbackToken,
    ) -> Result<Option<CallbackWaiter>, PersistenceError> {
        Ok(self.tables()?.waiters.get(token).cloned())
    }

    async fn list_waiters(&self) -> Result<Vec<CallbackWaiter>, PersistenceError> {
        let mut waiters: Vec<CallbackWaiter> = self.tables()?.waiters.values().cloned().collect();
        waiters.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(waiters)
    }

    async fn list_waiters_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<CallbackWaiter>, PersistenceError> {
        let mut waiters: Vec<CallbackWaiter> = self
            .tables()?
            .waiters
            .values()
            .filter(|waiter| &waiter.run_id == run_id)
            .cloned()
            .collect();
        waiters.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(waiters)
    }
}
