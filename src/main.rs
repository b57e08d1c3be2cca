use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use fraud_review::{
    init_telemetry, shutdown_telemetry, CallbackToken, EngineError, FraudReview,
    FraudReviewConfig, RunId, ShutdownCoordinator, WorkflowResult,
};

#[derive(Parser)]
#[command(name = "fraud-review")]
#[command(about = "Durable fraud review of card transactions")]
#[command(long_about = "Scores transactions, routes them to authorization or the fraud department, \
                       and asks the customer to confirm borderline ones. Runs survive restarts: \
                       use 'fraud-review recover' or 'fraud-review worker' after a crash.")]
struct Cli {
    /// Configuration file (defaults to ./fraud-review.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or pick up) the review of a transaction
    Start {
        /// Transaction JSON: {"id", "amount", "location", "vendor", "score"?}
        #[arg(long)]
        transaction: String,
    },
    /// Answer a verification callback
    Deliver {
        #[arg(long)]
        token: String,
        /// Callback payload JSON
        #[arg(long, default_value = r#"{"result":"approved"}"#)]
        payload: String,
    },
    /// Show a run's status, result, pending callbacks and steps
    Status {
        #[arg(long)]
        run: String,
    },
    /// Rebuild callback timers and re-drive unfinished runs, then exit
    Recover,
    /// Recover, then keep firing callback timeouts until Ctrl-C
    Worker,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FraudReviewConfig::load_from(Some(path))?,
        None => fraud_review::config()?.clone(),
    };
    init_telemetry(&config.observability)?;

    let outcome = tokio::runtime::Runtime::new()?.block_on(async {
        let review = FraudReview::from_config(&config).await?;
        let outcome = match cli.command {
            Commands::Start { transaction } => start_command(&review, &transaction).await,
            Commands::Deliver { token, payload } => deliver_command(&review, &token, &payload).await,
            Commands::Status { run } => status_command(&review, &run).await,
            Commands::Recover => recover_command(&review).await,
            Commands::Worker => worker_command(&review).await,
        };
        review.shutdown();
        outcome
    });

    shutdown_telemetry();
    outcome
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn start_command(review: &FraudReview, transaction: &str) -> Result<()> {
    let value: Value = serde_json::from_str(transaction).context("transaction is not valid JSON")?;
    let transaction_id = value.get("id").and_then(Value::as_i64);
    let amount = value.get("amount").and_then(Value::as_f64);

    match review.start_json(value).await {
        Ok(snapshot) => {
            if snapshot.result.is_none() {
                println!("⏳ Run {} is {}; waiting for customer verification", snapshot.run_id, snapshot.status);
                for waiter in &snapshot.pending_callbacks {
                    println!("  🔑 {}: {}", waiter.branch_id, waiter.callback_token);
                }
            }
            print_json(&snapshot)
        }
        Err(EngineError::InvalidInput(e)) => {
            print_json(&WorkflowResult::rejected(transaction_id, amount))?;
            anyhow::bail!("❌ Transaction rejected: {}", e)
        }
        Err(e) => Err(e.into()),
    }
}

async fn deliver_command(review: &FraudReview, token: &str, payload: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let outcome = review.deliver(&CallbackToken::from(token), payload).await?;
    println!("{}", outcome);
    Ok(())
}

async fn status_command(review: &FraudReview, run: &str) -> Result<()> {
    let snapshot = review.status(&RunId::new(run)).await?;
    print_json(&snapshot)
}

async fn recover_command(review: &FraudReview) -> Result<()> {
    println!("🔄 Recovering unfinished runs...");
    let report = review.recover().await?;
    println!(
        "✅ {} timers rescheduled, {} runs resumed, {} runs failed",
        report.timers_rescheduled, report.runs_resumed, report.runs_failed
    );
    Ok(())
}

async fn worker_command(review: &FraudReview) -> Result<()> {
    recover_command(review).await?;
    println!("👷 Worker running; press Ctrl-C to stop");
    ShutdownCoordinator::new().wait_for_shutdown(review).await
}
