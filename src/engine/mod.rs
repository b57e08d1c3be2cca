//! Replay-based durable workflow engine.
//!
//! A workflow is plain async code that routes every side effect through a
//! [`RunContext`]. Each step's outcome lands in an append-only ledger; when a
//! run is resumed (after a callback, a timeout or a crash) the workflow is
//! executed again from the top and recorded steps return their memoized
//! outcomes instead of running again.

pub mod callback;
pub mod controller;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod parallel;
pub mod retry;
pub mod store;
pub mod types;

pub use callback::{CallbackGateway, DeliveryOutcome, ResumeSignal};
pub use controller::{Engine, RecoveryReport, RunContext, RunSnapshot, Workflow, WorkflowRunController};
pub use error::{
    CollaboratorError, DuplicateStepError, EngineError, EngineResult, ErrorKind, InvalidInputError,
    PersistenceError,
};
pub use executor::{StepDefinition, StepExecutor};
pub use ledger::StepLedger;
pub use parallel::{Branch, BranchOutcome, CompletionPolicy, ParallelBranchResult, ParallelConfig};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{FileSystemStore, MemoryStore, RunStore};
pub use types::{
    CallbackResolution, CallbackToken, CallbackWaiter, RunId, RunStatus, StepOutcome, StepRecord,
    WaiterResolution, WorkflowRun,
};
