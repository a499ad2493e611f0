//! # qlistener AMQP plumbing
//!
//! Consumes queues into [`DeliveryHandler`](qlistener_core::prelude::DeliveryHandler)s and
//! publishes reporting notifications, over `lapin`.

#![deny(missing_docs)]

/// Queue and retry configuration
pub mod config;

/// The queue consumer runtime
pub mod consumer;

/// The broker-backed notifier
pub mod notifier;

pub use config::{QueueConfig, RetryPolicy};
pub use consumer::{Consumer, ConsumerError, ConsumerHandle};
pub use notifier::{AmqpNotifier, NotifierConfig, PendingBuffer, PendingNotification};
