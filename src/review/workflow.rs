use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::result::{CustomerVerificationResult, WorkflowResult};
use super::transaction::Transaction;
use crate::collaborators::scorer::RISK_SCORE_RANGE;
use crate::collaborators::{Notifier, ScoreRequest, Scorer, VerificationChannel};
use crate::engine::{
    Branch, BranchOutcome, CallbackResolution, CollaboratorError, EngineError, EngineResult,
    ParallelConfig, RetryPolicy, RunContext, RunId, StepDefinition, Workflow,
};

/// Name of the verification fan-out inside a run.
pub const VERIFICATION_FANOUT: &str = "human-verification";

/// Name of the callback each verification branch waits on.
pub const VERIFICATION_CALLBACK: &str = "verification";

/// Tunables of the review state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSettings {
    pub low_threshold: i64,
    pub high_threshold: i64,
    /// Score used when the scorer fails or answers outside its contract.
    pub max_escalation_score: i64,
    pub verification_timeout: Duration,
    pub verification: ParallelConfig,
    pub scorer_retry: RetryPolicy,
    pub notifier_retry: RetryPolicy,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            low_threshold: 3,
            high_threshold: 5,
            max_escalation_score: 5,
            verification_timeout: Duration::from_secs(24 * 60 * 60),
            verification: ParallelConfig::new(1, 1, 2),
            scorer_retry: RetryPolicy::transient(3).with_retryable(crate::engine::ErrorKind::MissingField),
            notifier_retry: RetryPolicy::transient(3),
        }
    }
}

impl ReviewSettings {
    /// State a score routes to.
    pub fn route(&self, score: i64) -> ReviewState {
        if score < self.low_threshold {
            ReviewState::Authorized
        } else if score >= self.high_threshold {
            ReviewState::Escalated
        } else {
            ReviewState::PendingVerification
        }
    }
}

/// States of a fraud review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    Scoring,
    Authorized,
    Escalated,
    PendingVerification,
    /// Input failed validation; no step ran.
    Rejected,
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReviewState::Scoring => "scoring",
            ReviewState::Authorized => "authorized",
            ReviewState::Escalated => "escalated",
            ReviewState::PendingVerification => "pending_verification",
            ReviewState::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// Every step a review may record, with its retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStep {
    FraudCheck,
    Authorize,
    SendToFraud,
    SuspendTransaction,
    SendVerification(VerificationChannel),
    AdvanceTransaction,
}

impl ReviewStep {
    pub fn name(self) -> &'static str {
        match self {
            ReviewStep::FraudCheck => "fraud-check",
            ReviewStep::Authorize => "authorize",
            ReviewStep::SendToFraud => "send-to-fraud",
            ReviewStep::SuspendTransaction => "suspend-transaction",
            // Scoped under the branch, so one name serves both channels.
            ReviewStep::SendVerification(_) => "send-verification",
            ReviewStep::AdvanceTransaction => "advance-transaction",
        }
    }

    pub fn definition(self, settings: &ReviewSettings) -> StepDefinition {
        let policy = match self {
            ReviewStep::FraudCheck => settings.scorer_retry.clone(),
            ReviewStep::SendVerification(_) => settings.notifier_retry.clone(),
            _ => RetryPolicy::no_retry(),
        };
        StepDefinition::new(self.name()).with_retry(policy)
    }
}

/// The fraud review state machine.
pub struct FraudReviewWorkflow {
    scorer: Arc<dyn Scorer>,
    notifier: Arc<dyn Notifier>,
    settings: ReviewSettings,
}

impl FraudReviewWorkflow {
    pub fn new(scorer: Arc<dyn Scorer>, notifier: Arc<dyn Notifier>, settings: ReviewSettings) -> Self {
        Self {
            scorer,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ReviewSettings {
        &self.settings
    }

    /// Supplied score, or the scorer's answer, or the fail-safe escalation
    /// score when the scorer cannot be trusted.
    async fn obtain_score(&self, ctx: &RunContext, transaction: &Transaction) -> EngineResult<i64> {
        if let Some(score) = transaction.supplied_score() {
            debug!(run_id = %ctx.run_id(), score, "Using supplied score");
            return Ok(score);
        }

        let request = ScoreRequest::from(transaction);
        let step = ReviewStep::FraudCheck.definition(&self.settings).with_input(&request)?;
        let scorer = self.scorer.clone();
        let scored = ctx
            .step(&step, |attempt| {
                let scorer = scorer.clone();
                let request = request.clone();
                async move {
                    debug!(attempt, vendor = %request.vendor, "Scoring transaction");
                    let score = scorer.score(&request).await?;
                    if !RISK_SCORE_RANGE.contains(&score) {
                        return Err(CollaboratorError::invalid_response(format!(
                            "risk score {score} is out of range"
                        )));
                    }
                    Ok(score)
                }
            })
            .await;

        match scored {
            Ok(score) => Ok(score),
            Err(EngineError::StepFailedPermanently { step_name, last_error }) => {
                warn!(
                    run_id = %ctx.run_id(),
                    step = %step_name,
                    error = %last_error,
                    fallback_score = self.settings.max_escalation_score,
                    "Scorer failed; escalating"
                );
                Ok(self.settings.max_escalation_score)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the final decision as a step so replays reuse it.
    async fn decide(
        &self,
        ctx: &RunContext,
        step: ReviewStep,
        result: WorkflowResult,
    ) -> EngineResult<WorkflowResult> {
        let definition = step.definition(&self.settings).with_input(&result)?;
        let decided = ctx
            .step(&definition, move |_| {
                let result = result.clone();
                async move { Ok::<_, CollaboratorError>(result) }
            })
            .await?;
        info!(run_id = %ctx.run_id(), step = step.name(), result = %decided.decision(), "Review decided");
        Ok(decided)
    }

    async fn verify_with_customer(
        &self,
        ctx: &RunContext,
        transaction: &Transaction,
        score: i64,
    ) -> EngineResult<WorkflowResult> {
        let suspend = ReviewStep::SuspendTransaction
            .definition(&self.settings)
            .with_input(&transaction.id)?;
        ctx.step(&suspend, |_| async {
            Ok::<_, CollaboratorError>(ReviewState::PendingVerification)
        })
        .await?;

        let branches: Vec<Arc<dyn Branch>> = VerificationChannel::ALL
            .into_iter()
            .map(|channel| {
                Arc::new(VerificationBranch {
                    channel,
                    transaction: transaction.clone(),
                    notifier: self.notifier.clone(),
                    timeout: self.settings.verification_timeout,
                    step: ReviewStep::SendVerification(channel).definition(&self.settings),
                }) as Arc<dyn Branch>
            })
            .collect();

        let verification = ctx
            .parallel(VERIFICATION_FANOUT, branches, &self.settings.verification)
            .await?;

        let result = if verification.success_count > 0 {
            WorkflowResult::authorized(
                transaction,
                score,
                Some(CustomerVerificationResult::TransactionApproved),
            )
        } else {
            WorkflowResult::sent_to_fraud(
                transaction,
                score,
                Some(CustomerVerificationResult::TransactionDeclined),
            )
        };
        self.decide(ctx, ReviewStep::AdvanceTransaction, result).await
    }
}

#[async_trait]
impl Workflow for FraudReviewWorkflow {
    type Input = Transaction;
    type Output = WorkflowResult;

    fn name(&self) -> &'static str {
        "fraud-review"
    }

    fn run_id(&self, input: &Transaction) -> RunId {
        input.run_id()
    }

    async fn execute(&self, ctx: RunContext, transaction: Transaction) -> EngineResult<WorkflowResult> {
        debug!(run_id = %ctx.run_id(), state = %ReviewState::Scoring, "Reviewing transaction");
        let score = self.obtain_score(&ctx, &transaction).await?;

        let state = self.settings.route(score);
        debug!(run_id = %ctx.run_id(), score, state = %state, "Transaction routed");

        match state {
            ReviewState::Authorized => {
                let result = WorkflowResult::authorized(&transaction, score, None);
                self.decide(&ctx, ReviewStep::Authorize, result).await
            }
            ReviewState::Escalated => {
                let result = WorkflowResult::sent_to_fraud(&transaction, score, None);
                self.decide(&ctx, ReviewStep::SendToFraud, result).await
            }
            _ => self.verify_with_customer(&ctx, &transaction, score).await,
        }
    }
}

/// Asks the customer over one channel and waits for the answer.
struct VerificationBranch {
    channel: VerificationChannel,
    transaction: Transaction,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    step: StepDefinition,
}

#[async_trait]
impl Branch for VerificationBranch {
    fn id(&self) -> &str {
        self.channel.as_str()
    }

    async fn run(&self, ctx: RunContext) -> EngineResult<BranchOutcome> {
        let channel = self.channel;
        let transaction = &self.transaction;
        let notifier = &self.notifier;
        let step = &self.step;
        let notify_ctx = &ctx;

        let resolution = ctx
            .wait_for_callback(VERIFICATION_CALLBACK, self.timeout, |token| async move {
                notify_ctx
                    .step(step, |_| {
                        let token = token.clone();
                        async move { notifier.notify(channel, transaction, &token).await }
                    })
                    .await
            })
            .await?;

        Ok(match resolution {
            CallbackResolution::Delivered { payload } => {
                BranchOutcome::success(json!({ "channel": channel, "result": payload }))
            }
            CallbackResolution::TimedOut => {
                BranchOutcome::failure(format!("{channel} verification timed out"))
            }
        })
    }
}
