//! Publishing reporting notifications to the broker.
//!
//! Publishing is fire-and-forget for the lifecycle handlers: a failed publish is buffered and
//! retried on [`flush`](Notifier::flush). Whatever is still unpublished when the buffer fills up
//! or at shutdown is appended to a JSON-lines file so it can be replayed by hand.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, error, info, warn};
use qlistener_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Event name of the envelope reporting notifications are wrapped in.
pub const REPORT_EVENT_NAME: &str = "ee";

/// Settings of the [`AmqpNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Queue receiving outflow events
    pub outflow_queue: String,
    /// Queue receiving billing-collected events
    pub transaction_queue: String,
    /// File unpublished notifications are appended to
    pub pending_file: PathBuf,
    /// Failed notifications kept in memory before they are written to `pending_file`
    pub pending_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            outflow_queue: "reporter_outflow".to_string(),
            transaction_queue: "reporter_transaction".to_string(),
            pending_file: PathBuf::from("notifier_pending.jsonl"),
            pending_capacity: 1000,
        }
    }
}

impl NotifierConfig {
    /// The broker queue name of a notification queue.
    pub fn queue_name(&self, queue: NotifyQueue) -> &str {
        match queue {
            NotifyQueue::Outflow => &self.outflow_queue,
            NotifyQueue::Transaction => &self.transaction_queue,
        }
    }
}

#[derive(Serialize)]
struct ReportEnvelope<'a> {
    event_name: &'a str,
    event_data: &'a Collect,
}

/// A notification that could not be published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    /// Where it was going
    pub queue: NotifyQueue,
    /// The event
    pub event: Collect,
}

/// In-memory buffer of failed notifications that spills to a JSON-lines file.
#[derive(Debug)]
pub struct PendingBuffer {
    path: PathBuf,
    capacity: usize,
    items: Vec<PendingNotification>,
}

impl PendingBuffer {
    /// Creates an empty buffer spilling to `path` once it holds `capacity` items.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            items: Vec::new(),
        }
    }

    /// The spill file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffered notifications.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Buffers a notification, spilling the whole buffer to the file once it is full.
    pub async fn push(&mut self, pending: PendingNotification) -> Result<(), NotifierError> {
        self.items.push(pending);
        if self.items.len() >= self.capacity {
            warn!(
                "Pending notifications buffer full ({}), writing to {}",
                self.items.len(),
                self.path.display()
            );
            self.persist().await?;
        }
        Ok(())
    }

    /// Takes every buffered notification out.
    pub fn drain(&mut self) -> Vec<PendingNotification> {
        std::mem::take(&mut self.items)
    }

    /// Appends every buffered notification to the file, one JSON object per line, and empties
    /// the buffer. Returns how many were written.
    pub async fn persist(&mut self) -> Result<usize, NotifierError> {
        if self.items.is_empty() {
            return Ok(0);
        }
        let mut lines = Vec::new();
        for item in &self.items {
            serde_json::to_writer(&mut lines, item)?;
            lines.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&lines).await?;
        file.flush().await?;

        let written = self.items.len();
        self.items.clear();
        info!(
            "Wrote {} pending notifications to {}",
            written,
            self.path.display()
        );
        Ok(written)
    }
}

/// A [`Notifier`] publishing to broker queues.
pub struct AmqpNotifier {
    config: NotifierConfig,
    connection: Connection,
    channel: Channel,
    pending: Mutex<PendingBuffer>,
}

impl AmqpNotifier {
    /// Connects to the broker and declares both notification queues.
    pub async fn connect(url: &str, config: NotifierConfig) -> Result<Self, NotifierError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(publish_error)?;
        let channel = connection.create_channel().await.map_err(publish_error)?;
        for queue in [&config.outflow_queue, &config.transaction_queue] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(publish_error)?;
        }
        info!(
            "Notifier ready: outflow -> '{}', transactions -> '{}'",
            config.outflow_queue, config.transaction_queue
        );

        let pending = PendingBuffer::new(config.pending_file.clone(), config.pending_capacity);
        Ok(Self {
            config,
            connection,
            channel,
            pending: Mutex::new(pending),
        })
    }

    async fn send(&self, queue: NotifyQueue, event: &Collect) -> Result<(), NotifierError> {
        let body = serde_json::to_vec(&ReportEnvelope {
            event_name: REPORT_EVENT_NAME,
            event_data: event,
        })?;
        self.channel
            .basic_publish(
                "",
                self.config.queue_name(queue),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        Ok(())
    }

    /// Closes the broker connection.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "notifier stopped").await {
            debug!("Closing notifier connection: {}", e);
        }
    }
}

fn publish_error(e: lapin::Error) -> NotifierError {
    NotifierError::Publish(Box::new(e))
}

#[async_trait]
impl Notifier for AmqpNotifier {
    async fn publish(&self, queue: NotifyQueue, event: Collect) -> Result<(), NotifierError> {
        match self.send(queue, &event).await {
            Ok(()) => {
                debug!("Published {:?} notification tid={}", queue, event.tid);
                Ok(())
            }
            Err(e) => {
                self.pending
                    .lock()
                    .await
                    .push(PendingNotification { queue, event })
                    .await?;
                Err(e)
            }
        }
    }

    async fn flush(&self) -> Result<(), NotifierError> {
        let mut pending = self.pending.lock().await;
        let items = pending.drain();
        if items.is_empty() {
            return Ok(());
        }
        info!("Flushing {} pending notifications", items.len());

        for item in items {
            if let Err(e) = self.send(item.queue, &item.event).await {
                error!(
                    "Failed to publish pending {:?} notification tid={}: {}",
                    item.queue, item.event.tid, e
                );
                pending.items.push(item);
            }
        }
        pending.persist().await?;
        Ok(())
    }
}
