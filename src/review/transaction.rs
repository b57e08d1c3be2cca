use serde::{Deserialize, Serialize};

use crate::engine::{InvalidInputError, RunId};

/// Transaction as submitted by a caller, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub id: Option<i64>,
    pub amount: Option<f64>,
    pub location: Option<String>,
    pub vendor: Option<String>,
    /// Pre-computed risk score; 0 or absent means "not scored yet".
    #[serde(default)]
    pub score: Option<i64>,
}

impl TransactionRequest {
    /// Check required fields and build the immutable transaction.
    pub fn validate(self) -> Result<Transaction, InvalidInputError> {
        let id = self.id.ok_or_else(|| InvalidInputError::missing("id"))?;

        let amount = self.amount.ok_or_else(|| InvalidInputError::missing("amount"))?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(InvalidInputError::invalid(
                "amount",
                format!("must be a positive number, got {amount}"),
            ));
        }

        let location = required_text("location", self.location)?;
        let vendor = required_text("vendor", self.vendor)?;

        let score = self.score.unwrap_or(0);
        if score < 0 {
            return Err(InvalidInputError::invalid(
                "score",
                format!("must not be negative, got {score}"),
            ));
        }

        Ok(Transaction {
            id,
            amount,
            location,
            vendor,
            score,
        })
    }
}

fn required_text(field: &str, value: Option<String>) -> Result<String, InvalidInputError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        Some(_) => Err(InvalidInputError::invalid(field, "must not be empty")),
        None => Err(InvalidInputError::missing(field)),
    }
}

/// A validated transaction under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub amount: f64,
    pub location: String,
    pub vendor: String,
    pub score: i64,
}

impl Transaction {
    /// Runs are keyed by transaction id, so resubmitting maps to one run.
    pub fn run_id(&self) -> RunId {
        RunId::new(format!("fraud-review-{}", self.id))
    }

    /// Score supplied by the caller, if any.
    pub fn supplied_score(&self) -> Option<i64> {
        (self.score != 0).then_some(self.score)
    }
}
