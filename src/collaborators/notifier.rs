use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::engine::{CallbackToken, CollaboratorError};
use crate::review::Transaction;

/// Channel used to ask the customer to confirm a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationChannel {
    Email,
    Sms,
}

impl VerificationChannel {
    pub const ALL: [VerificationChannel; 2] = [VerificationChannel::Email, VerificationChannel::Sms];

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationChannel::Email => "email",
            VerificationChannel::Sms => "sms",
        }
    }
}

impl fmt::Display for VerificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers verification prompts to customers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        channel: VerificationChannel,
        transaction: &Transaction,
        callback_token: &CallbackToken,
    ) -> Result<(), CollaboratorError>;
}

/// Notifier that only logs the prompt. The operator answers it with
/// `fraud-review deliver --token <token>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        channel: VerificationChannel,
        transaction: &Transaction,
        callback_token: &CallbackToken,
    ) -> Result<(), CollaboratorError> {
        info!(
            %channel,
            transaction_id = transaction.id,
            amount = transaction.amount,
            vendor = %transaction.vendor,
            callback_token = %callback_token,
            "Customer verification requested"
        );
        Ok(())
    }
}
