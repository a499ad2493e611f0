//! The consumption contract shared by every queue, and the MT manager dispatcher.
//!
//! A [`DeliveryHandler`] gets the raw body of one delivery and decides whether the broker should
//! forget it ([`Disposition::Ack`]) or hand it out again ([`Disposition::Requeue`]). Payloads that
//! can never succeed are acked and counted; storage failures are requeued.

use crate::event::{DecodeError, MtEvent};
use crate::lifecycle::{HandlerError, MtManager};
use crate::store::SubscriptionStore;
use async_trait::async_trait;
use log::{debug, error};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// What the consumer must do with a delivery once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge: the message is done, successfully or permanently dropped
    Ack,
    /// Negative-acknowledge with requeue: the failure is transient
    Requeue,
}

/// Handles the raw body of a delivery.
///
/// Implemented by every queue consumer; the runtime settles the delivery according to the
/// returned [`Disposition`], exactly once.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handles one message body.
    async fn handle(&self, body: &[u8]) -> Disposition;
}

/// Per-queue counters of delivery outcomes.
#[derive(Debug, Default)]
pub struct ConsumerCounters {
    dropped: AtomicU64,
    empty: AtomicU64,
    unknown: AtomicU64,
    rejected: AtomicU64,
    db_errors: AtomicU64,
    success: AtomicU64,
}

/// A point-in-time copy of [`ConsumerCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    /// Messages acked without being applied
    pub dropped: u64,
    /// Messages missing mandatory fields
    pub empty: u64,
    /// Messages with an unknown event name
    pub unknown: u64,
    /// Messages failing a handler precondition
    pub rejected: u64,
    /// Messages requeued because the store failed
    pub db_errors: u64,
    /// Messages applied
    pub success: u64,
}

impl ConsumerCounters {
    /// Reads all counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dropped: self.dropped.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decodes MT manager deliveries and applies them through an [`MtManager`].
pub struct Dispatcher<S> {
    queue: String,
    manager: MtManager<S>,
    counters: Arc<ConsumerCounters>,
}

impl<S> Dispatcher<S>
where
    S: SubscriptionStore,
{
    /// Creates a dispatcher for the named queue.
    pub fn new(queue: impl Into<String>, manager: MtManager<S>) -> Self {
        Self {
            queue: queue.into(),
            manager,
            counters: Arc::new(ConsumerCounters::default()),
        }
    }

    /// The counters of this dispatcher.
    pub fn counters(&self) -> Arc<ConsumerCounters> {
        Arc::clone(&self.counters)
    }

    /// The lifecycle manager events are applied through.
    pub fn manager(&self) -> &MtManager<S> {
        &self.manager
    }

    /// Decodes and applies one message body.
    pub async fn dispatch(&self, body: &[u8]) -> Disposition {
        let event = match MtEvent::decode(body) {
            Ok(event) => event,
            Err(e) => {
                ConsumerCounters::inc(&self.counters.dropped);
                match &e {
                    DecodeError::Malformed(_) => {}
                    DecodeError::Invalid(_) => ConsumerCounters::inc(&self.counters.empty),
                    DecodeError::UnknownEvent(_) => ConsumerCounters::inc(&self.counters.unknown),
                }
                error!(
                    "[{}] dropped: {}; body: {}",
                    self.queue,
                    e,
                    String::from_utf8_lossy(body)
                );
                return Disposition::Ack;
            }
        };

        let begin = Instant::now();
        match self.manager.handle(&event).await {
            Ok(()) => {
                ConsumerCounters::inc(&self.counters.success);
                debug!(
                    "[{}] {} tid={} applied in {:?}",
                    self.queue,
                    event.kind(),
                    event.record().tid,
                    begin.elapsed()
                );
                Disposition::Ack
            }
            Err(e @ HandlerError::Rejected { .. }) => {
                ConsumerCounters::inc(&self.counters.dropped);
                ConsumerCounters::inc(&self.counters.rejected);
                error!(
                    "[{}] dropped tid={}: {}",
                    self.queue,
                    event.record().tid,
                    e
                );
                Disposition::Ack
            }
            Err(e @ HandlerError::Storage(_)) => {
                ConsumerCounters::inc(&self.counters.db_errors);
                error!(
                    "[{}] requeue {} tid={}: {}",
                    self.queue,
                    event.kind(),
                    event.record().tid,
                    e
                );
                Disposition::Requeue
            }
        }
    }
}

#[async_trait]
impl<S> DeliveryHandler for Dispatcher<S>
where
    S: SubscriptionStore,
{
    async fn handle(&self, body: &[u8]) -> Disposition {
        self.dispatch(body).await
    }
}
