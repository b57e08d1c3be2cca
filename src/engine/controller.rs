use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::callback::{CallbackGateway, DeliveryOutcome, ResumeSignal};
use super::error::{CollaboratorError, EngineError, EngineResult, InvalidInputError, PersistenceError};
use super::executor::{StepDefinition, StepExecutor};
use super::ledger::StepLedger;
use super::parallel::{run_parallel, Branch, ParallelBranchResult, ParallelConfig};
use super::store::RunStore;
use super::types::{
    content_hash, CallbackResolution, CallbackToken, CallbackWaiter, RunId, RunStatus,
    StepOutcome, StepRecord, WaiterResolution, WorkflowRun,
};
use crate::observability::EngineMetrics;
use crate::telemetry::{generate_correlation_id, run_span};

/// Last segment of the step that records a waiter's token.
const REGISTER_STEP: &str = "register";

/// A durable workflow definition.
///
/// `execute` is re-driven from the top on every resume, so everything with a
/// side effect must go through the supplied context.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Deterministic run id for an input; starting twice maps to one run.
    fn run_id(&self, input: &Self::Input) -> RunId;

    async fn execute(&self, ctx: RunContext, input: Self::Input) -> EngineResult<Self::Output>;
}

/// Replay handle passed to workflows and branches.
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    scope: String,
    ledger: Arc<StepLedger>,
    gateway: Arc<CallbackGateway>,
    executor: StepExecutor,
}

impl RunContext {
    pub(crate) fn new(
        ledger: Arc<StepLedger>,
        gateway: Arc<CallbackGateway>,
        executor: StepExecutor,
    ) -> Self {
        Self {
            run_id: ledger.run_id().clone(),
            scope: String::new(),
            ledger,
            gateway,
            executor,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Step-name prefix of this context; empty at the run root.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn scoped(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope, name)
        }
    }

    /// Context for one branch of the fan-out `fanout`.
    pub fn for_branch(&self, fanout: &str, branch_id: &str) -> Self {
        Self {
            scope: self.scoped(&format!("{fanout}/{branch_id}")),
            ..self.clone()
        }
    }

    /// Run a memoized, retried step.
    pub async fn step<T, F, Fut>(&self, step: &StepDefinition, f: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let scoped = step.renamed(self.scoped(&step.name));
        self.executor.execute(&self.ledger, &scoped, f).await
    }

    /// Record a value computed by the workflow itself (a decision, a state
    /// change) so replays reuse it.
    pub async fn record<T, F, Fut>(&self, name: &str, f: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.executor.memoize(&self.ledger, &self.scoped(name), f).await
    }

    /// The successful value recorded under `name`, if any.
    pub async fn recorded<T: DeserializeOwned>(&self, name: &str) -> Option<EngineResult<T>> {
        let step_name = self.scoped(name);
        match self.ledger.lookup(&step_name).await? {
            StepOutcome::Success { value } => Some(serde_json::from_value(value).map_err(|source| {
                EngineError::StepSerialization { step_name, source }
            })),
            StepOutcome::Failure { .. } => None,
        }
    }

    /// Park until an external party answers or `timeout` elapses.
    ///
    /// The waiter is registered once per run; `submit` receives its token on
    /// every drive and must itself be idempotent (typically a step). While
    /// the waiter is pending this returns `EngineError::Suspended`.
    pub async fn wait_for_callback<F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        submit: F,
    ) -> EngineResult<CallbackResolution>
    where
        F: FnOnce(CallbackToken) -> Fut,
        Fut: Future<Output = EngineResult<()>>,
    {
        let resolution_step = format!("{name}/resolution");
        if let Some(resolution) = self.recorded::<CallbackResolution>(&resolution_step).await {
            return resolution;
        }

        let gateway = self.gateway.clone();
        let run_id = self.run_id.clone();
        let branch_id = self.scope.clone();
        let token: CallbackToken = self
            .record(&format!("{name}/{REGISTER_STEP}"), || async move {
                gateway.register_waiter(&run_id, &branch_id, timeout).await
            })
            .await?;

        submit(token.clone()).await?;

        let resolution = match self.gateway.resolution(&token).await? {
            Some(WaiterResolution::Pending) => {
                debug!(run_id = %self.run_id, callback_token = %token, "Waiting for callback");
                return Err(EngineError::Suspended {
                    run_id: self.run_id.clone(),
                });
            }
            Some(WaiterResolution::Delivered { payload }) => CallbackResolution::Delivered { payload },
            Some(WaiterResolution::TimedOut) => CallbackResolution::TimedOut,
            None => {
                return Err(PersistenceError::StateCorruption {
                    reason: format!("waiter {token} of run {} is missing", self.run_id),
                }
                .into());
            }
        };

        self.record(&resolution_step, || async move { Ok(resolution) })
            .await
    }

    /// Fan out into `branches` under `name`.
    pub async fn parallel(
        &self,
        name: &str,
        branches: Vec<Arc<dyn Branch>>,
        config: &ParallelConfig,
    ) -> EngineResult<ParallelBranchResult> {
        run_parallel(self, name, branches, config).await
    }
}

/// Operator view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot<O> {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub result: Option<O>,
    pub failure: Option<String>,
    pub pending_callbacks: Vec<CallbackWaiter>,
    pub steps: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub timers_rescheduled: usize,
    pub runs_resumed: usize,
    pub runs_failed: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives runs of one workflow: start, resume, deliver, inspect.
pub struct WorkflowRunController<W: Workflow> {
    workflow: Arc<W>,
    store: Arc<dyn RunStore>,
    gateway: Arc<CallbackGateway>,
    executor: StepExecutor,
    drive_locks: Mutex<HashMap<RunId, Arc<AsyncMutex<()>>>>,
}

impl<W: Workflow> WorkflowRunController<W> {
    pub fn new(
        workflow: Arc<W>,
        store: Arc<dyn RunStore>,
        gateway: Arc<CallbackGateway>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            workflow,
            store,
            gateway,
            executor: StepExecutor::new(metrics),
            drive_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<CallbackGateway> {
        &self.gateway
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        self.executor.metrics()
    }

    /// Start a run for `input`, or pick up the existing one.
    ///
    /// A terminal run returns its recorded result; a live run is re-driven
    /// with its originally recorded input.
    pub async fn start(&self, input: W::Input) -> EngineResult<RunSnapshot<W::Output>> {
        let run_id = self.workflow.run_id(&input);
        let drive_lock = self.drive_lock(&run_id);
        let _guard = drive_lock.lock().await;

        match self.store.load_run(&run_id).await? {
            Some(run) if run.status.is_terminal() => {
                info!(run_id = %run_id, status = %run.status, "Run already finished; returning recorded result");
            }
            Some(run) => {
                info!(run_id = %run_id, status = %run.status, "Run already exists; re-driving");
                self.drive(run).await?;
            }
            None => {
                let input = serde_json::to_value(&input).map_err(PersistenceError::from)?;
                let run = WorkflowRun::new(run_id.clone(), self.workflow.name(), input);
                self.store.save_run(&run).await?;
                info!(run_id = %run_id, workflow = self.workflow.name(), "Run started");
                self.drive(run).await?;
            }
        }

        drop(_guard);
        self.release_drive_locks();
        self.snapshot(&run_id).await
    }

    /// Re-drive a run after an external event.
    pub async fn resume(&self, run_id: &RunId) -> EngineResult<RunSnapshot<W::Output>> {
        let drive_lock = self.drive_lock(run_id);
        let guard = drive_lock.lock().await;

        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.clone(),
            })?;

        if run.status.is_terminal() {
            self.record_late_resolutions(&run).await?;
        } else {
            self.drive(run).await?;
        }

        drop(guard);
        self.release_drive_locks();
        self.snapshot(run_id).await
    }

    /// Resolve a waiter and resume its run.
    ///
    /// The resolution is durable before this returns. A failure while
    /// resuming is logged; the run is picked up again by recovery.
    pub async fn deliver_callback(
        &self,
        token: &CallbackToken,
        payload: Value,
    ) -> EngineResult<DeliveryOutcome> {
        let outcome = self.gateway.deliver(token, payload).await?;
        if !outcome.is_accepted() {
            return Ok(outcome);
        }

        if let Some(waiter) = self.gateway.waiter(token).await? {
            if let Err(e) = self.resume(&waiter.run_id).await {
                error!(
                    run_id = %waiter.run_id,
                    callback_token = %token,
                    error = %e,
                    "Failed to resume run after callback delivery"
                );
            }
        }
        Ok(outcome)
    }

    /// Rebuild callback timers and re-drive every run left unfinished.
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport {
            timers_rescheduled: self.gateway.recover().await?,
            ..RecoveryReport::default()
        };

        for run in self.store.list_runs().await? {
            if run.status.is_terminal() {
                continue;
            }
            match self.resume(&run.run_id).await {
                Ok(snapshot) => {
                    debug!(run_id = %run.run_id, status = %snapshot.status, "Run recovered");
                    report.runs_resumed += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "Run recovery failed");
                    report.runs_failed += 1;
                }
            }
        }

        info!(
            timers_rescheduled = report.timers_rescheduled,
            runs_resumed = report.runs_resumed,
            runs_failed = report.runs_failed,
            "Recovery finished"
        );
        Ok(report)
    }

    pub async fn snapshot(&self, run_id: &RunId) -> EngineResult<RunSnapshot<W::Output>> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.clone(),
            })?;

        let result = match run.result {
            Some(value) => Some(serde_json::from_value(value).map_err(PersistenceError::from)?),
            None => None,
        };

        let steps = self.store.read_steps(run_id).await?;
        let registered = registered_tokens(&steps);
        let pending_callbacks = self
            .gateway
            .pending_for_run(run_id)
            .await?
            .into_iter()
            .filter(|waiter| registered.contains(&waiter.callback_token))
            .collect();

        Ok(RunSnapshot {
            steps,
            pending_callbacks,
            run_id: run.run_id,
            workflow: run.workflow,
            status: run.status,
            result,
            failure: run.failure,
            created_at: run.created_at,
            updated_at: run.updated_at,
        })
    }

    /// Drive `run` forward until it finishes or parks. The caller holds the
    /// run's drive lock.
    async fn drive(&self, run: WorkflowRun) -> EngineResult<()> {
        let span = run_span(self.workflow.name(), run.run_id.as_str(), &generate_correlation_id());
        self.drive_in_span(run).instrument(span).await
    }

    async fn drive_in_span(&self, mut run: WorkflowRun) -> EngineResult<()> {
        let ledger = Arc::new(StepLedger::open(run.run_id.clone(), self.store.clone()).await?);
        let input: W::Input = serde_json::from_value(run.input.clone()).map_err(|e| {
            InvalidInputError::malformed(format!("recorded input no longer decodes: {e}"))
        })?;

        if run.status != RunStatus::Running {
            run.transition(RunStatus::Running);
            self.store.save_run(&run).await?;
        }
        let replayable_steps = ledger.len().await;
        debug!(replayable_steps, "Driving run");

        let ctx = RunContext::new(ledger, self.gateway.clone(), self.executor.clone());
        match self.workflow.execute(ctx, input).await {
            Ok(output) => {
                run.result = Some(serde_json::to_value(&output).map_err(PersistenceError::from)?);
                run.transition(RunStatus::Completed);
                self.store.save_run(&run).await?;
                self.metrics().record_run_completed();
                info!(run_id = %run.run_id, "Run completed");
                self.archive(&run.run_id).await;
                Ok(())
            }
            Err(e) if e.is_suspension() => {
                run.transition(RunStatus::Suspended);
                self.store.save_run(&run).await?;
                info!(run_id = %run.run_id, "Run suspended awaiting external input");
                Ok(())
            }
            Err(e) => {
                run.failure = Some(e.to_string());
                run.transition(RunStatus::Failed);
                self.metrics().record_run_failed();
                error!(run_id = %run.run_id, error = %e, "Run failed");
                match self.store.save_run(&run).await {
                    Ok(()) => self.archive(&run.run_id).await,
                    Err(save_error) => {
                        error!(run_id = %run.run_id, error = %save_error, "Could not record run failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn archive(&self, run_id: &RunId) {
        if let Err(e) = self.store.archive_run(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to archive finished run");
        }
    }

    /// Record resolutions that arrived after the run finished. The result is
    /// never changed; the outcome is kept in the ledger for auditing.
    async fn record_late_resolutions(&self, run: &WorkflowRun) -> EngineResult<()> {
        let registered = registered_tokens(&self.store.read_steps(&run.run_id).await?);
        let waiters: Vec<CallbackWaiter> = self
            .store
            .list_waiters_for_run(&run.run_id)
            .await?
            .into_iter()
            .filter(|w| !w.resolution.is_pending())
            .filter(|w| {
                let known = registered.contains(&w.callback_token);
                if !known {
                    debug!(run_id = %run.run_id, callback_token = %w.callback_token, "Ignoring unregistered waiter");
                }
                known
            })
            .collect();
        if waiters.is_empty() {
            return Ok(());
        }

        let ledger = StepLedger::open(run.run_id.clone(), self.store.clone()).await?;
        for waiter in waiters {
            let step_name = if waiter.branch_id.is_empty() {
                format!("late-resolution/{}", waiter.callback_token)
            } else {
                format!("{}/outcome", waiter.branch_id)
            };
            if ledger.contains(&step_name).await {
                continue;
            }

            let value = json!({
                "late": true,
                "callback_token": &waiter.callback_token,
                "resolution": &waiter.resolution,
            });
            ledger
                .append(StepRecord::success(&step_name, 1, content_hash(&Value::Null), value))
                .await?;
            self.metrics().record_late_resolution();
            info!(
                run_id = %run.run_id,
                status = %run.status,
                branch = %waiter.branch_id,
                callback_token = %waiter.callback_token,
                "Late signal recorded for finished run; result unchanged"
            );
        }
        Ok(())
    }

    fn drive_lock(&self, run_id: &RunId) -> Arc<AsyncMutex<()>> {
        lock(&self.drive_locks)
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    /// Number of runs currently being driven or waiting to be.
    pub fn active_drives(&self) -> usize {
        lock(&self.drive_locks)
            .values()
            .filter(|l| Arc::strong_count(l) > 1)
            .count()
    }

    /// Forget locks nobody is holding or waiting on.
    fn release_drive_locks(&self) {
        lock(&self.drive_locks).retain(|_, l| Arc::strong_count(l) > 1);
    }
}

/// Tokens whose registration reached the ledger. A waiter persisted by a
/// drive that died before recording its token is never observed by the run.
fn registered_tokens(steps: &[StepRecord]) -> HashSet<CallbackToken> {
    steps
        .iter()
        .filter(|record| record.step_name.rsplit('/').next() == Some(REGISTER_STEP))
        .filter_map(|record| match &record.outcome {
            StepOutcome::Success { value } => serde_json::from_value(value.clone()).ok(),
            StepOutcome::Failure { .. } => None,
        })
        .collect()
}

/// A controller plus the background task that re-drives runs when their
/// callback timers fire.
pub struct Engine<W: Workflow> {
    controller: Arc<WorkflowRunController<W>>,
    resumer: JoinHandle<()>,
}

impl<W: Workflow> Engine<W> {
    /// Must be called inside a Tokio runtime.
    pub fn new(workflow: W, store: Arc<dyn RunStore>) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let gateway = CallbackGateway::new(store.clone(), resume_tx, metrics.clone());
        let controller = Arc::new(WorkflowRunController::new(
            Arc::new(workflow),
            store,
            gateway,
            metrics,
        ));
        let resumer = tokio::spawn(run_resumer(Arc::downgrade(&controller), resume_rx));
        Self {
            controller,
            resumer,
        }
    }

    pub fn controller(&self) -> &Arc<WorkflowRunController<W>> {
        &self.controller
    }

    pub async fn start(&self, input: W::Input) -> EngineResult<RunSnapshot<W::Output>> {
        self.controller.start(input).await
    }

    pub async fn deliver_callback(
        &self,
        token: &CallbackToken,
        payload: Value,
    ) -> EngineResult<DeliveryOutcome> {
        self.controller.deliver_callback(token, payload).await
    }

    pub async fn resume(&self, run_id: &RunId) -> EngineResult<RunSnapshot<W::Output>> {
        self.controller.resume(run_id).await
    }

    pub async fn snapshot(&self, run_id: &RunId) -> EngineResult<RunSnapshot<W::Output>> {
        self.controller.snapshot(run_id).await
    }

    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        self.controller.recover().await
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        self.controller.metrics()
    }

    /// Stop the resumer and abort callback timers. Timers are rebuilt by the
    /// next `recover`.
    pub fn shutdown(&self) {
        self.resumer.abort();
        self.controller.gateway().shutdown();
        info!("Engine stopped");
    }
}

impl<W: Workflow> Drop for Engine<W> {
    fn drop(&mut self) {
        self.resumer.abort();
        self.controller.gateway().shutdown();
    }
}

async fn run_resumer<W: Workflow>(
    controller: Weak<WorkflowRunController<W>>,
    mut signals: mpsc::UnboundedReceiver<ResumeSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            match controller.resume(&signal.run_id).await {
                Ok(snapshot) => debug!(
                    run_id = %signal.run_id,
                    callback_token = %signal.callback_token,
                    status = %snapshot.status,
                    "Run resumed after callback timeout"
                ),
                Err(e) => warn!(
                    run_id = %signal.run_id,
                    callback_token = %signal.callback_token,
                    error = %e,
                    "Resume after callback timeout failed"
                ),
            }
        });
    }
    debug!("Resumer stopped");
}
