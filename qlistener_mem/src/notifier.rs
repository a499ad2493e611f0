use async_trait::async_trait;
use qlistener_core::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Errors returned by the [`InMemoryNotifier`] when it is set to fail.
#[derive(Debug, thiserror::Error)]
#[error("notifier unavailable")]
pub struct InMemoryNotifierUnavailable;

/// A notifier that records every published event.
#[derive(Clone, Debug, Default)]
pub struct InMemoryNotifier {
    published: Arc<Mutex<Vec<(NotifyQueue, Collect)>>>,
    failing: Arc<AtomicBool>,
    flushes: Arc<Mutex<u32>>,
}

impl InMemoryNotifier {
    /// Creates a new notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `publish` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every event published so far, in order.
    pub async fn published(&self) -> Vec<(NotifyQueue, Collect)> {
        self.published.lock().await.clone()
    }

    /// The events published to one queue, in order.
    pub async fn published_to(&self, queue: NotifyQueue) -> Vec<Collect> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// How many times `flush` was called.
    pub async fn flushes(&self) -> u32 {
        *self.flushes.lock().await
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, queue: NotifyQueue, event: Collect) -> Result<(), NotifierError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifierError::Publish(Box::new(InMemoryNotifierUnavailable)));
        }
        log::debug!("InMemoryNotifier: {:?} <- tid={}", queue, event.tid);
        self.published.lock().await.push((queue, event));
        Ok(())
    }

    async fn flush(&self) -> Result<(), NotifierError> {
        *self.flushes.lock().await += 1;
        Ok(())
    }
}
