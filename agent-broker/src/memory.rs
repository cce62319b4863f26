//! In-process broker
//!
//! Honours the same credit contract as an AMQP broker: a consumer channel
//! never holds more unsettled deliveries than its prefetch allows, and a
//! closed channel returns its unsettled deliveries to the queue. Every
//! delivery and settlement is counted so tests can observe the flow-control
//! discipline of the consumers.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::delivery::{Acknowledger, Delivery};
use crate::error::{BrokerError, Result};
use crate::{Broker, Consumer, ConsumerOptions, QueueStatus, Topology};

/// Counters describing everything the broker has observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Settlement calls for deliveries the broker no longer tracked
    pub unknown_settlements: u64,
    /// Highest number of unsettled deliveries seen on a single consumer
    pub max_in_flight_per_consumer: usize,
    /// Highest number of unsettled deliveries seen across all consumers
    pub max_in_flight_total: usize,
}

impl BrokerStats {
    /// Deliveries settled by ack or reject
    pub fn settled(&self) -> u64 {
        self.acked + self.rejected
    }
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Outstanding {
    consumer: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    outstanding: HashMap<u64, Outstanding>,
    in_flight: HashMap<u64, usize>,
    dead_letters: Vec<Vec<u8>>,
    next_tag: u64,
    next_consumer: u64,
    closed: bool,
    stats: BrokerStats,
}

impl State {
    fn try_deliver(&mut self, consumer: u64, prefetch: u16) -> Option<(u64, Message)> {
        let in_flight = self.in_flight.get(&consumer).copied()?;
        if prefetch > 0 && in_flight >= usize::from(prefetch) {
            return None;
        }

        let message = self.ready.pop_front()?;
        self.next_tag += 1;
        let tag = self.next_tag;

        self.outstanding.insert(
            tag,
            Outstanding {
                consumer,
                message: message.clone(),
            },
        );
        self.in_flight.insert(consumer, in_flight + 1);

        self.stats.delivered += 1;
        if message.redelivered {
            self.stats.redelivered += 1;
        }
        self.stats.max_in_flight_per_consumer =
            self.stats.max_in_flight_per_consumer.max(in_flight + 1);
        self.stats.max_in_flight_total = self.stats.max_in_flight_total.max(self.outstanding.len());

        Some((tag, message))
    }

    fn take_outstanding(&mut self, consumer: u64, tag: u64) -> Option<Message> {
        match self.outstanding.get(&tag) {
            Some(entry) if entry.consumer == consumer => {}
            _ => {
                self.stats.unknown_settlements += 1;
                return None;
            }
        }

        let entry = self.outstanding.remove(&tag)?;
        if let Some(count) = self.in_flight.get_mut(&consumer) {
            *count = count.saturating_sub(1);
        }
        Some(entry.message)
    }

    /// Moves unsettled deliveries back to the head of the queue
    fn requeue_where(&mut self, predicate: impl Fn(&Outstanding) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.iter().rev() {
            if let Some(entry) = self.outstanding.remove(tag) {
                if let Some(count) = self.in_flight.get_mut(&entry.consumer) {
                    *count = count.saturating_sub(1);
                }
                self.ready.push_front(Message {
                    payload: entry.message.payload,
                    redelivered: true,
                });
            }
        }

        tags.len()
    }
}

struct Inner {
    topology: Topology,
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new(topology: Topology) -> Self {
        Self {
            inner: Arc::new(Inner {
                topology,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns a snapshot of the broker counters
    pub fn stats(&self) -> BrokerStats {
        self.inner.lock().stats.clone()
    }

    /// Number of deliveries currently unsettled
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Number of messages waiting for delivery
    pub fn ready(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Payloads rejected without requeue while a dead-letter exchange is set
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.inner.lock().dead_letters.clone()
    }

    /// Returns every unsettled delivery to the queue
    ///
    /// Simulates the broker losing track of outstanding deliveries, e.g.
    /// after a consumer heartbeat timeout. Settling one of the old handles
    /// afterwards fails with [`BrokerError::UnknownDelivery`].
    pub fn redeliver_unacked(&self) -> usize {
        let count = self.inner.lock().requeue_where(|_| true);
        if count > 0 {
            debug!(count, "returned unsettled deliveries to the queue");
            self.inner.notify.notify_waiters();
        }
        count
    }

    /// Waits until at least `count` deliveries have been settled
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_settled(&self, count: u64, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.inner.lock().stats.settled() >= count {
                    return;
                }

                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_consumer(&self, options: ConsumerOptions) -> Result<Box<dyn Consumer>> {
        let id = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.next_consumer += 1;
            let id = state.next_consumer;
            state.in_flight.insert(id, 0);
            id
        };

        debug!(consumer = %options.tag, prefetch = options.prefetch, "opened memory consumer");

        Ok(Box::new(MemoryConsumer {
            id,
            tag: options.tag,
            prefetch: options.prefetch,
            inner: self.inner.clone(),
            closed: false,
        }))
    }

    async fn publish(&self, payload: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.ready.push_back(Message {
                payload: payload.to_vec(),
                redelivered: false,
            });
            state.stats.published += 1;
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn queue_status(&self) -> Result<QueueStatus> {
        let state = self.inner.lock();
        Ok(QueueStatus {
            messages: u32::try_from(state.ready.len()).unwrap_or(u32::MAX),
            consumers: u32::try_from(state.in_flight.len()).unwrap_or(u32::MAX),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.inner.topology.queue)
    }
}

struct MemoryConsumer {
    id: u64,
    tag: String,
    prefetch: u16,
    inner: Arc<Inner>,
    closed: bool,
}

impl MemoryConsumer {
    fn release(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;

        let id = self.id;
        let requeued = {
            let mut state = self.inner.lock();
            let requeued = state.requeue_where(|entry| entry.consumer == id);
            state.in_flight.remove(&id);
            requeued
        };

        self.inner.notify.notify_waiters();
        requeued
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Ok(None);
                }

                if let Some((tag, message)) = state.try_deliver(self.id, self.prefetch) {
                    let acker = MemoryAcker {
                        consumer: self.id,
                        inner: self.inner.clone(),
                    };
                    return Ok(Some(Delivery::new(
                        tag,
                        message.payload,
                        message.redelivered,
                        Box::new(acker),
                    )));
                }
            }

            notified.await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        let requeued = self.release();
        if requeued > 0 {
            warn!(consumer = %self.tag, requeued, "closed consumer with unsettled deliveries");
        }
        Ok(())
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemoryAcker {
    consumer: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, tag: u64) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.take_outstanding(self.consumer, tag).is_none() {
                return Err(BrokerError::UnknownDelivery(tag));
            }
            state.stats.acked += 1;
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let Some(message) = state.take_outstanding(self.consumer, tag) else {
                return Err(BrokerError::UnknownDelivery(tag));
            };
            state.stats.rejected += 1;

            if requeue {
                state.stats.requeued += 1;
                state.ready.push_back(Message {
                    payload: message.payload,
                    redelivered: true,
                });
            } else if self.inner.topology.dead_letter_exchange.is_some() {
                state.stats.dead_lettered += 1;
                state.dead_letters.push(message.payload);
            }
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }
}
