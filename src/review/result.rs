use serde::{Deserialize, Serialize};
use std::fmt;

use super::transaction::Transaction;

/// Final routing decision of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    #[serde(rename = "authorized")]
    Authorized,
    SentToFraudDept,
    Unknown,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReviewDecision::Authorized => "authorized",
            ReviewDecision::SentToFraudDept => "SentToFraudDept",
            ReviewDecision::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Outcome of the customer verification fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerVerificationResult {
    TransactionApproved,
    TransactionDeclined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    pub transaction_id: Option<i64>,
    pub amount: Option<f64>,
    pub fraud_score: Option<i64>,
    pub result: ReviewDecision,
    #[serde(
        rename = "customerVerificationResult",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub customer_verification_result: Option<CustomerVerificationResult>,
}

/// Response returned to the caller that started the review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: ResultBody,
}

impl WorkflowResult {
    fn decided(
        transaction: &Transaction,
        fraud_score: i64,
        result: ReviewDecision,
        verification: Option<CustomerVerificationResult>,
    ) -> Self {
        Self {
            status_code: 200,
            body: ResultBody {
                transaction_id: Some(transaction.id),
                amount: Some(transaction.amount),
                fraud_score: Some(fraud_score),
                result,
                customer_verification_result: verification,
            },
        }
    }

    pub fn authorized(
        transaction: &Transaction,
        fraud_score: i64,
        verification: Option<CustomerVerificationResult>,
    ) -> Self {
        Self::decided(transaction, fraud_score, ReviewDecision::Authorized, verification)
    }

    pub fn sent_to_fraud(
        transaction: &Transaction,
        fraud_score: i64,
        verification: Option<CustomerVerificationResult>,
    ) -> Self {
        Self::decided(transaction, fraud_score, ReviewDecision::SentToFraudDept, verification)
    }

    /// The 400 shape for input that never reached the workflow.
    pub fn rejected(transaction_id: Option<i64>, amount: Option<f64>) -> Self {
        Self {
            status_code: 400,
            body: ResultBody {
                transaction_id,
                amount,
                fraud_score: None,
                result: ReviewDecision::Unknown,
                customer_verification_result: None,
            },
        }
    }

    pub fn decision(&self) -> ReviewDecision {
        self.body.result
    }
}
