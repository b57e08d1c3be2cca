use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::controller::RunContext;
use super::error::{EngineError, EngineResult};

/// When a fan-out may stop waiting for its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPolicy {
    pub min_successful: usize,
    pub tolerated_failures: usize,
}

impl CompletionPolicy {
    /// `Some(true)` once enough branches succeeded, `Some(false)` once too
    /// many failed or success became unreachable, `None` while undecided.
    pub fn evaluate(&self, successes: usize, failures: usize, total: usize) -> Option<bool> {
        if successes >= self.min_successful {
            return Some(true);
        }
        if failures > self.tolerated_failures {
            return Some(false);
        }
        let unresolved = total.saturating_sub(successes + failures);
        if successes + unresolved < self.min_successful {
            return Some(false);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub completion: CompletionPolicy,
    pub max_concurrency: usize,
}

impl ParallelConfig {
    pub fn new(min_successful: usize, tolerated_failures: usize, max_concurrency: usize) -> Self {
        Self {
            completion: CompletionPolicy {
                min_successful,
                tolerated_failures,
            },
            max_concurrency,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::InvalidConfiguration {
                reason: "max_concurrency must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Terminal outcome of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchOutcome {
    Success { value: serde_json::Value },
    Failure { error: String },
}

impl BranchOutcome {
    pub fn success(value: serde_json::Value) -> Self {
        BranchOutcome::Success { value }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        BranchOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BranchOutcome::Success { .. })
    }
}

/// Aggregate result handed to the parent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranchResult {
    pub branch_outcomes: BTreeMap<String, BranchOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    pub completed: bool,
}

/// One concurrent sub-sequence of steps.
///
/// Steps run through the supplied context are scoped under
/// `<fanout>/<branch id>/`, so branch ids must be unique within a fan-out.
#[async_trait]
pub trait Branch: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: RunContext) -> EngineResult<BranchOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recorded {
    /// Arrived after the aggregate was decided (or twice).
    Late,
    Counted,
    /// This outcome decided the aggregate.
    Completed,
}

/// Outcome counters for one fan-out. Each branch may be counted once.
#[derive(Debug)]
struct FanOutTally {
    policy: CompletionPolicy,
    resolved: Vec<AtomicBool>,
    successes: AtomicUsize,
    failures: AtomicUsize,
    completed: AtomicBool,
}

impl FanOutTally {
    fn new(total: usize, policy: CompletionPolicy) -> Self {
        let tally = Self {
            policy,
            resolved: (0..total).map(|_| AtomicBool::new(false)).collect(),
            successes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        };
        if policy.evaluate(0, 0, total).is_some() {
            tally.completed.store(true, Ordering::SeqCst);
        }
        tally
    }

    fn record(&self, index: usize, success: bool) -> Recorded {
        if self.completed.load(Ordering::SeqCst) {
            return Recorded::Late;
        }
        let Some(flag) = self.resolved.get(index) else {
            return Recorded::Late;
        };
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Recorded::Late;
        }

        let (successes, failures) = if success {
            (
                self.successes.fetch_add(1, Ordering::SeqCst) + 1,
                self.failures.load(Ordering::SeqCst),
            )
        } else {
            (
                self.successes.load(Ordering::SeqCst),
                self.failures.fetch_add(1, Ordering::SeqCst) + 1,
            )
        };

        let decided = self
            .policy
            .evaluate(successes, failures, self.resolved.len())
            .is_some();
        if decided
            && self
                .completed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            Recorded::Completed
        } else {
            Recorded::Counted
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn result(&self, branch_outcomes: BTreeMap<String, BranchOutcome>) -> ParallelBranchResult {
        ParallelBranchResult {
            branch_outcomes,
            success_count: self.successes.load(Ordering::SeqCst),
            failure_count: self.failures.load(Ordering::SeqCst),
            completed: self.is_completed(),
        }
    }
}

enum BranchReport {
    Terminal(BranchOutcome),
    Suspended,
}

type BranchJoin = (usize, EngineResult<BranchReport>);

/// Run `branches` concurrently under `name` and fold their outcomes with the
/// completion policy.
///
/// The aggregate is memoized under `name`. While it is undecided and some
/// branch is parked on a callback, the fan-out suspends the run. Branches
/// still running once it is decided are left to finish on their own and
/// their outcomes are discarded.
pub async fn run_parallel(
    ctx: &RunContext,
    name: &str,
    branches: Vec<Arc<dyn Branch>>,
    config: &ParallelConfig,
) -> EngineResult<ParallelBranchResult> {
    config.validate()?;
    ctx.record(name, || fan_out(ctx, name, branches, config)).await
}

async fn fan_out(
    ctx: &RunContext,
    name: &str,
    branches: Vec<Arc<dyn Branch>>,
    config: &ParallelConfig,
) -> EngineResult<ParallelBranchResult> {
    let ids: Vec<String> = branches.iter().map(|b| b.id().to_string()).collect();
    let unique: HashSet<&String> = ids.iter().collect();
    if unique.len() != ids.len() {
        return Err(EngineError::InvalidConfiguration {
            reason: format!("fan-out '{name}' has duplicate branch ids"),
        });
    }

    let tally = Arc::new(FanOutTally::new(ids.len(), config.completion));
    if tally.is_completed() {
        return Ok(tally.result(BTreeMap::new()));
    }

    info!(
        run_id = %ctx.run_id(),
        fanout = %name,
        branches = ids.len(),
        max_concurrency = config.max_concurrency,
        "Starting parallel branches"
    );

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
    let mut set: JoinSet<BranchJoin> = JoinSet::new();
    for (index, branch) in branches.into_iter().enumerate() {
        let branch_ctx = ctx.for_branch(name, branch.id());
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let report = match semaphore.acquire_owned().await {
                Ok(_permit) => run_branch(branch_ctx, branch).await,
                Err(_) => Err(EngineError::InvalidConfiguration {
                    reason: "branch semaphore closed".to_string(),
                }),
            };
            (index, report)
        });
    }

    let mut outcomes = BTreeMap::new();
    let mut suspended = 0usize;
    while let Some(joined) = set.join_next().await {
        let (index, report) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(run_id = %ctx.run_id(), fanout = %name, error = %e, "Branch task lost");
                continue;
            }
        };
        let branch_id = &ids[index];

        match report? {
            BranchReport::Terminal(outcome) => {
                let recorded = tally.record(index, outcome.is_success());
                debug!(
                    run_id = %ctx.run_id(),
                    fanout = %name,
                    branch = %branch_id,
                    success = outcome.is_success(),
                    recorded = ?recorded,
                    "Branch reached terminal outcome"
                );
                if recorded != Recorded::Late {
                    outcomes.insert(branch_id.clone(), outcome);
                }
            }
            BranchReport::Suspended => {
                debug!(run_id = %ctx.run_id(), fanout = %name, branch = %branch_id, "Branch suspended");
                suspended += 1;
            }
        }

        if tally.is_completed() {
            let result = tally.result(outcomes);
            info!(
                run_id = %ctx.run_id(),
                fanout = %name,
                success_count = result.success_count,
                failure_count = result.failure_count,
                outstanding = set.len(),
                "Parallel branches completed"
            );
            if !set.is_empty() {
                drain_late_branches(set, tally, ids, ctx.run_id().to_string(), name.to_string());
            }
            return Ok(result);
        }
    }

    if suspended > 0 {
        return Err(EngineError::Suspended {
            run_id: ctx.run_id().clone(),
        });
    }
    Ok(tally.result(outcomes))
}

/// Replay a branch's recorded outcome or run it to its next stopping point.
async fn run_branch(ctx: RunContext, branch: Arc<dyn Branch>) -> EngineResult<BranchReport> {
    if let Some(outcome) = ctx.recorded::<BranchOutcome>("outcome").await {
        return Ok(BranchReport::Terminal(outcome?));
    }

    // Run on its own task so a panicking branch counts as a failure.
    let handle = tokio::spawn({
        let ctx = ctx.clone();
        async move { branch.run(ctx).await }
    });
    let outcome = match handle.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if e.is_branch_failure() => BranchOutcome::failure(e.to_string()),
        Ok(Err(e)) if e.is_suspension() => return Ok(BranchReport::Suspended),
        Ok(Err(e)) => return Err(e),
        Err(e) => BranchOutcome::failure(format!("branch task failed: {e}")),
    };

    let recorded = ctx.record("outcome", || async move { Ok(outcome) }).await?;
    Ok(BranchReport::Terminal(recorded))
}

fn drain_late_branches(
    mut set: JoinSet<BranchJoin>,
    tally: Arc<FanOutTally>,
    ids: Vec<String>,
    run_id: String,
    fanout: String,
) {
    tokio::spawn(async move {
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(BranchReport::Terminal(outcome)))) => {
                    tally.record(index, outcome.is_success());
                    info!(
                        run_id = %run_id,
                        fanout = %fanout,
                        branch = %ids[index],
                        success = outcome.is_success(),
                        "Late branch outcome discarded"
                    );
                }
                Ok((index, Ok(BranchReport::Suspended))) => {
                    debug!(run_id = %run_id, fanout = %fanout, branch = %ids[index], "Late branch still waiting");
                }
                Ok((index, Err(e))) => {
                    warn!(run_id = %run_id, fanout = %fanout, branch = %ids[index], error = %e, "Late branch failed");
                }
                Err(e) => {
                    warn!(run_id = %run_id, fanout = %fanout, error = %e, "Late branch task lost");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::controller::tests::test_context;
    use crate::engine::error::CollaboratorError;
    use crate::engine::executor::StepDefinition;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct FixedBranch {
        id: String,
        succeed: bool,
        delay: Duration,
        runs: Arc<AtomicU32>,
    }

    impl FixedBranch {
        fn new(id: &str, succeed: bool, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                succeed,
                delay: Duration::from_millis(delay_ms),
                runs: Arc::new(AtomicU32::new(0)),
            })
        }
    }

    #[async_trait]
    impl Branch for FixedBranch {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, ctx: RunContext) -> EngineResult<BranchOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let succeed = self.succeed;
            ctx.step(&StepDefinition::new("work"), move |_| async move {
                if succeed {
                    Ok(json!({"done": true}))
                } else {
                    Err(CollaboratorError::rejected("no"))
                }
            })
            .await
            .map(BranchOutcome::success)
        }
    }

    struct ParkedBranch {
        id: String,
    }

    #[async_trait]
    impl Branch for ParkedBranch {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, ctx: RunContext) -> EngineResult<BranchOutcome> {
            Err(EngineError::Suspended {
                run_id: ctx.run_id().clone(),
            })
        }
    }

    fn as_branches(branches: Vec<Arc<FixedBranch>>) -> Vec<Arc<dyn Branch>> {
        branches
            .into_iter()
            .map(|b| b as Arc<dyn Branch>)
            .collect()
    }

    #[test]
    fn test_completion_policy_evaluation() {
        let policy = CompletionPolicy {
            min_successful: 1,
            tolerated_failures: 1,
        };
        assert_eq!(policy.evaluate(0, 0, 2), None);
        assert_eq!(policy.evaluate(1, 0, 2), Some(true));
        assert_eq!(policy.evaluate(0, 1, 2), None);
        assert_eq!(policy.evaluate(0, 2, 2), Some(false));

        let strict = CompletionPolicy {
            min_successful: 2,
            tolerated_failures: 5,
        };
        // One of two branches failed: two successes are no longer reachable.
        assert_eq!(strict.evaluate(0, 1, 2), Some(false));
    }

    #[test]
    fn test_tally_counts_each_branch_once() {
        let tally = FanOutTally::new(
            3,
            CompletionPolicy {
                min_successful: 2,
                tolerated_failures: 1,
            },
        );
        assert_eq!(tally.record(0, true), Recorded::Counted);
        assert_eq!(tally.record(0, true), Recorded::Late);
        assert_eq!(tally.record(1, true), Recorded::Completed);
        assert_eq!(tally.record(2, false), Recorded::Late);

        let result = tally.result(BTreeMap::new());
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 0);
        assert!(result.completed);
    }

    #[test]
    fn test_tally_under_concurrent_reports() {
        const BRANCHES: usize = 8;
        let tally = FanOutTally::new(
            BRANCHES,
            CompletionPolicy {
                min_successful: BRANCHES,
                tolerated_failures: 0,
            },
        );

        // Every branch is reported by four threads at once.
        let recorded: Vec<Recorded> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..BRANCHES * 4)
                .map(|n| {
                    let tally = &tally;
                    scope.spawn(move || tally.record(n % BRANCHES, true))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let counted = recorded.iter().filter(|r| **r != Recorded::Late).count();
        let completed = recorded.iter().filter(|r| **r == Recorded::Completed).count();
        assert_eq!(counted, BRANCHES);
        assert_eq!(completed, 1);

        let result = tally.result(BTreeMap::new());
        assert_eq!(result.success_count, BRANCHES);
        assert_eq!(result.failure_count, 0);
        assert!(result.completed);
    }

    #[tokio::test]
    async fn test_first_success_completes_without_waiting() {
        let ctx = test_context("run-1").await;
        let fast = FixedBranch::new("fast", true, 0);
        let slow = FixedBranch::new("slow", true, 5_000);

        let result = run_parallel(
            &ctx,
            "verify",
            as_branches(vec![fast, slow]),
            &ParallelConfig::new(1, 1, 2),
        )
        .await
        .unwrap();

        assert!(result.completed);
        assert_eq!(result.success_count, 1);
        assert_eq!(result.branch_outcomes.len(), 1);
        assert!(result.branch_outcomes.contains_key("fast"));
    }

    #[tokio::test]
    async fn test_all_failures_resolve_as_failed_complete() {
        let ctx = test_context("run-1").await;
        let result = run_parallel(
            &ctx,
            "verify",
            as_branches(vec![
                FixedBranch::new("email", false, 0),
                FixedBranch::new("sms", false, 0),
            ]),
            &ParallelConfig::new(1, 1, 2),
        )
        .await
        .unwrap();

        assert!(result.completed);
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failure_count, 2);
    }

    #[tokio::test]
    async fn test_result_is_memoized_across_replays() {
        let ctx = test_context("run-1").await;
        let email = FixedBranch::new("email", true, 0);
        let runs = email.runs.clone();
        let config = ParallelConfig::new(1, 1, 1);

        let first = run_parallel(&ctx, "verify", vec![email.clone() as Arc<dyn Branch>], &config)
            .await
            .unwrap();
        let second = run_parallel(&ctx, "verify", vec![email as Arc<dyn Branch>], &config)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecided_fan_out_with_parked_branch_suspends() {
        let ctx = test_context("run-1").await;
        let branches: Vec<Arc<dyn Branch>> = vec![
            FixedBranch::new("email", false, 0),
            Arc::new(ParkedBranch {
                id: "sms".to_string(),
            }),
        ];

        let err = run_parallel(&ctx, "verify", branches, &ParallelConfig::new(1, 1, 2))
            .await
            .unwrap_err();
        assert!(err.is_suspension());
        // The failed branch outcome is recorded for the next replay.
        assert!(ctx.recorded::<BranchOutcome>("verify/email/outcome").await.is_some());
        assert!(ctx.recorded::<ParallelBranchResult>("verify").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_fan_out_is_decided_immediately() {
        let ctx = test_context("run-1").await;
        let result = run_parallel(&ctx, "nothing", Vec::new(), &ParallelConfig::new(1, 0, 1))
            .await
            .unwrap();
        assert!(result.completed);
        assert_eq!(result.success_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_branch_ids_are_rejected() {
        let ctx = test_context("run-1").await;
        let err = run_parallel(
            &ctx,
            "verify",
            as_branches(vec![
                FixedBranch::new("email", true, 0),
                FixedBranch::new("email", true, 0),
            ]),
            &ParallelConfig::new(1, 1, 2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    }
}
