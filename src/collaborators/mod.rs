//! External collaborators of the fraud review workflow.
//!
//! Both are traits so the workflow can be driven against fakes in tests and
//! against real transports in production.

pub mod notifier;
pub mod scorer;

pub use notifier::{Notifier, TracingNotifier, VerificationChannel};
pub use scorer::{parse_risk_score, HttpScorer, ScoreRequest, Scorer, UnconfiguredScorer};

#[cfg(test)]
pub use notifier::MockNotifier;
#[cfg(test)]
pub use scorer::MockScorer;
