//! Downstream notifications for the reporting service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The reporting queues the MT manager publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyQueue {
    /// Subscriptions leaving active billing
    Outflow,
    /// Billing transactions
    Transaction,
}

/// The summarized billing event sent to reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Collect {
    /// Transaction id
    pub tid: String,
    /// Campaign code
    pub campaign_code: String,
    /// Mobile operator code
    pub operator_code: i64,
    /// Subscriber phone number
    pub msisdn: String,
    /// Price
    pub price: i32,
    /// Billing result or new subscription status
    pub transaction_result: String,
    /// Billing attempts so far
    pub attempts_count: i32,
}

/// Errors raised while notifying reporting.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    /// The event couldn't be encoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The transport refused the event
    #[error("publish error: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Pending events couldn't be written to disk
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Publishes [`Collect`] events, best effort.
///
/// Callers never let a notifier error change the outcome of the write that produced the event.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publishes an event to the given queue.
    async fn publish(&self, queue: NotifyQueue, event: Collect) -> Result<(), NotifierError>;

    /// Pushes out or persists anything still buffered. Called on shutdown.
    async fn flush(&self) -> Result<(), NotifierError> {
        Ok(())
    }
}
