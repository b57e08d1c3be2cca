//! Durable storage for runs, step ledgers and callback waiters.

use async_trait::async_trait;

use super::error::PersistenceError;
use super::types::{
    CallbackToken, CallbackWaiter, RunId, StepRecord, WaiterResolution, WorkflowRun,
};

pub mod filesystem;
pub mod memory;

pub use filesystem::FileSystemStore;
pub use memory::MemoryStore;

/// Result of moving a waiter out of `Pending`.
#[derive(Debug, Clone, PartialEq)]
pub enum WaiterTransition {
    /// The waiter was pending and now carries the new resolution.
    Applied(CallbackWaiter),
    /// Another writer resolved it first; the persisted waiter is returned.
    AlreadyResolved(CallbackWaiter),
    Missing,
}

/// Trait for durable engine state.
///
/// Every write must be durable when the returned future resolves: the engine
/// acknowledges step outcomes and callback deliveries only after that point.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create or overwrite the run header.
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), PersistenceError>;

    /// Load a run header, including archived runs.
    async fn load_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, PersistenceError>;

    /// Active (not archived) runs.
    async fn list_runs(&self) -> Result<Vec<WorkflowRun>, PersistenceError>;

    /// Move a terminal run out of the active set. The ledger is kept.
    async fn archive_run(&self, run_id: &RunId) -> Result<(), PersistenceError>;

    async fn append_step(&self, run_id: &RunId, record: &StepRecord) -> Result<(), PersistenceError>;

    /// Ledger entries in append order.
    async fn read_steps(&self, run_id: &RunId) -> Result<Vec<StepRecord>, PersistenceError>;

    /// Persist a newly registered waiter.
    async fn save_waiter(&self, waiter: &CallbackWaiter) -> Result<(), PersistenceError>;

    /// Compare-and-set on the waiter's resolution: applied only while the
    /// persisted waiter is still pending. Every writer sharing the store,
    /// including other processes, observes a single winner.
    async fn resolve_waiter(
        &self,
        token: &CallbackToken,
        resolution: &WaiterResolution,
    ) -> Result<WaiterTransition, PersistenceError>;

    async fn load_waiter(
        &self,
        token: &CallbackToken,
    ) -> Result<Option<CallbackWaiter>, PersistenceError>;

    async fn list_waiters(&self) -> Result<Vec<CallbackWaiter>, PersistenceError>;

    /// Waiters registered by one run, oldest first.
    async fn list_waiters_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<CallbackWaiter>, PersistenceError>;
}
