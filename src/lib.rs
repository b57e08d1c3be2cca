// Fraud Review Library - durable replay-based workflows
// This exposes the engine and the fraud review workflow for the CLI and tests

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod observability;
pub mod review;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use collaborators::{
    HttpScorer, Notifier, ScoreRequest, Scorer, TracingNotifier, UnconfiguredScorer,
    VerificationChannel,
};
pub use config::{config, init_config, FraudReviewConfig, StorageBackend};
pub use engine::{
    CallbackResolution, CallbackToken, CollaboratorError, DeliveryOutcome, Engine, EngineError,
    EngineResult, ErrorKind, FileSystemStore, MemoryStore, RetryPolicy, RunContext, RunId,
    RunStatus, RunStore, Workflow,
};
pub use observability::{EngineMetrics, EngineStats, OperationTimer};
pub use review::{
    CustomerVerificationResult, FraudReview, FraudReviewWorkflow, ReviewDecision, ReviewSettings,
    ReviewSnapshot, Transaction, TransactionRequest, WorkflowResult,
};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
