//! Failure policy
//!
//! Decides how a delivery is settled when its grading failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

/// How to settle a message whose grading failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Acknowledge and drop the message
    #[default]
    Acknowledge,

    /// Reject with requeue on first delivery, drop on redelivery
    Requeue,

    /// Reject without requeue so the broker dead-letters it
    DeadLetter,
}

/// Settlement chosen for one failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl FailurePolicy {
    /// Settlement for a failed delivery, given whether the broker has
    /// already delivered it before
    pub fn settlement(&self, redelivered: bool) -> Settlement {
        match self {
            FailurePolicy::Acknowledge => Settlement::Ack,
            FailurePolicy::Requeue => Settlement::Reject {
                requeue: !redelivered,
            },
            FailurePolicy::DeadLetter => Settlement::Reject { requeue: false },
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Acknowledge => write!(f, "acknowledge"),
            FailurePolicy::Requeue => write!(f, "requeue"),
            FailurePolicy::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" | "ack" => Ok(FailurePolicy::Acknowledge),
            "requeue" => Ok(FailurePolicy::Requeue),
            "dead-letter" | "dead_letter" | "deadletter" => Ok(FailurePolicy::DeadLetter),
            other => Err(ConfigurationError::invalid(
                "failure_policy",
                format!("unknown policy '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_always_acks() {
        let policy = FailurePolicy::Acknowledge;
        assert_eq!(policy.settlement(false), Settlement::Ack);
        assert_eq!(policy.settlement(true), Settlement::Ack);
    }

    #[test]
    fn test_requeue_retries_once() {
        let policy = FailurePolicy::Requeue;
        assert_eq!(policy.settlement(false), Settlement::Reject { requeue: true });
        assert_eq!(policy.settlement(true), Settlement::Reject { requeue: false });
    }

    #[test]
    fn test_dead_letter_never_requeues() {
        let policy = FailurePolicy::DeadLetter;
        assert_eq!(policy.settlement(false), Settlement::Reject { requeue: false });
    }

    #[test]
    fn test_parse_round_trips_display() {
        for policy in [
            FailurePolicy::Acknowledge,
            FailurePolicy::Requeue,
            FailurePolicy::DeadLetter,
        ] {
            assert_eq!(policy.to_string().parse::<FailurePolicy>().unwrap(), policy);
        }
        assert!("retry-forever".parse::<FailurePolicy>().is_err());
    }
}
