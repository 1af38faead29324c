//! Delivery contract the flush engine drives.

use std::fmt;

use crate::model::PendingMutation;

/// Result of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The remote side durably accepted the mutation.
    Delivered,
    /// The remote side declined this mutation. Counts against its retry budget.
    Rejected { reason: String },
    /// The channel itself failed. Says nothing about the mutation.
    Unreachable { reason: String },
}

impl AttemptOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }

    /// Classify an HTTP response status.
    ///
    /// Request timeout and gateway errors describe the path to the server rather
    /// than the mutation, so they halt the drain instead of burning a retry.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Delivered,
            408 | 502 | 503 | 504 => Self::unreachable(format!("HTTP {status}")),
            other => Self::rejected(format!("HTTP {other}")),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::Unreachable { reason } => write!(f, "unreachable: {reason}"),
        }
    }
}

/// Sends one mutation to the remote side.
///
/// Ordinary remote refusals must come back as [`AttemptOutcome::Rejected`], never
/// as a panic. Delivery is at-least-once, so implementations should forward
/// `mutation.id` as an idempotency key.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn attempt(&self, mutation: &PendingMutation) -> AttemptOutcome;
}
