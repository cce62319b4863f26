//! Error types for broker access

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur when talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// AMQP protocol or connection failure
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker connection has been closed
    #[error("broker connection closed")]
    Closed,

    /// The delivery was already acknowledged or rejected through this handle
    #[error("delivery {0} was already settled")]
    AlreadySettled(u64),

    /// The broker no longer tracks the delivery as outstanding for this consumer
    #[error("delivery {0} is not outstanding on this channel")]
    UnknownDelivery(u64),

    /// The broker refused the acknowledgment or rejection
    #[error("failed to settle delivery {tag}: {reason}")]
    Settlement {
        /// Delivery tag that could not be settled
        tag: u64,
        /// Reason reported by the broker client
        reason: String,
    },

    /// The broker negatively acknowledged a published message
    #[error("broker refused the published message")]
    PublishRefused,

    /// The broker URL scheme is not supported
    #[error("unsupported broker URL: {0}")]
    UnsupportedUrl(String),
}

impl BrokerError {
    /// Check if this error means the acknowledgment lost a race with the broker
    ///
    /// These errors are recoverable: the message is no longer ours to settle
    /// and the consumer can move on to the next delivery.
    pub fn is_settlement_race(&self) -> bool {
        matches!(
            self,
            Self::AlreadySettled(_) | Self::UnknownDelivery(_) | Self::Settlement { .. }
        )
    }

    /// Check if this error means the connection is gone
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Amqp(err) => matches!(
                err,
                lapin::Error::InvalidConnectionState(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::IOError(_)
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_race_classification() {
        assert!(BrokerError::AlreadySettled(1).is_settlement_race());
        assert!(BrokerError::UnknownDelivery(1).is_settlement_race());
        assert!(
            BrokerError::Settlement {
                tag: 1,
                reason: "PRECONDITION_FAILED".to_string()
            }
            .is_settlement_race()
        );
        assert!(!BrokerError::Closed.is_settlement_race());
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(BrokerError::Closed.is_connection_lost());
        assert!(!BrokerError::UnknownDelivery(3).is_connection_lost());
        assert!(!BrokerError::UnsupportedUrl("redis://".into()).is_connection_lost());
        assert!(!BrokerError::PublishRefused.is_connection_lost());
        assert!(!BrokerError::PublishRefused.is_settlement_race());
    }
}
