//! Delivered messages and their settlement handles

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{BrokerError, Result};

/// Broker-side settlement of a single delivery
///
/// Implemented by each broker backend; the [`Delivery`] wrapper guarantees
/// that at most one settlement call reaches it.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: u64) -> Result<()>;

    async fn reject(&self, tag: u64, requeue: bool) -> Result<()>;
}

/// One delivered, not yet settled message
///
/// Exactly one of [`Delivery::ack`] or [`Delivery::reject`] takes effect.
/// Any further call returns [`BrokerError::AlreadySettled`] instead of
/// reaching the broker.
pub struct Delivery {
    tag: u64,
    payload: Vec<u8>,
    redelivered: bool,
    settled: AtomicBool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub(crate) fn new(
        tag: u64,
        payload: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            payload,
            redelivered,
            settled: AtomicBool::new(false),
            acker,
        }
    }

    /// Broker-assigned delivery tag
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the broker delivered this message before
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledges the message, removing it from the queue
    pub async fn ack(&self) -> Result<()> {
        self.mark_settled()?;
        self.acker.ack(self.tag).await
    }

    /// Rejects the message, optionally returning it to the queue
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.mark_settled()?;
        self.acker.reject(self.tag, requeue).await
    }

    fn mark_settled(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled(self.tag));
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}
