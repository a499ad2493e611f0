//! The queue consumer runtime.
//!
//! One connection and channel per queue, `threads_count` workers sharing the delivery stream.
//! Every delivery is settled exactly once according to the [`Disposition`] returned by the
//! queue's [`DeliveryHandler`]. A worker that can't settle a delivery stops with a fatal error
//! instead of moving on.

use crate::config::{QueueConfig, RetryPolicy};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use log::{debug, error, info, warn};
use qlistener_core::prelude::*;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Errors raised by the consumer runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The broker connection, channel or queue could not be set up
    #[error("[{queue}] setup failed: {source}")]
    Setup {
        /// The queue being started
        queue: String,
        /// The broker error
        #[source]
        source: lapin::Error,
    },
    /// A delivery could not be acked or nacked within the retry budget
    #[error("[{queue}] failed to settle delivery {delivery_tag} after {attempts} attempts: {source}")]
    Acknowledge {
        /// The queue of the delivery
        queue: String,
        /// The delivery tag
        delivery_tag: u64,
        /// Attempts made
        attempts: u32,
        /// The last broker error
        #[source]
        source: lapin::Error,
    },
    /// The delivery stream failed
    #[error("[{queue}] delivery stream failed: {source}")]
    Stream {
        /// The queue being consumed
        queue: String,
        /// The broker error
        #[source]
        source: lapin::Error,
    },
    /// A worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Starts consumers for queues.
#[derive(Debug, Clone)]
pub struct Consumer {
    url: String,
    config: QueueConfig,
    retry: RetryPolicy,
    tag_prefix: String,
}

impl Consumer {
    /// Creates a consumer of the configured queue on the broker at `url`.
    pub fn new(url: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            url: url.into(),
            config,
            retry: RetryPolicy::default(),
            tag_prefix: "qlistener".to_string(),
        }
    }

    /// Sets the prefix of the consumer tag, usually the application name.
    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    /// The tag the broker shows for this consumer: `<prefix>-<queue>`.
    pub fn consumer_tag(&self) -> String {
        format!("{}-{}", self.tag_prefix, self.config.name)
    }

    /// Sets the retry policy used to settle deliveries.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connects, declares the queue and spawns the workers.
    ///
    /// Returns `Ok(None)` when the queue is disabled.
    pub async fn start(
        self,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Option<ConsumerHandle>, ConsumerError> {
        let queue = self.config.name.clone();
        if !self.config.enabled {
            info!("[{}] queue disabled, not consuming", queue);
            return Ok(None);
        }

        let setup = |source| ConsumerError::Setup {
            queue: queue.clone(),
            source,
        };

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(setup)?;
        let channel = connection.create_channel().await.map_err(setup)?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(setup)?;
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        let deliveries = channel
            .basic_consume(
                &queue,
                &self.consumer_tag(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;

        let threads = self.config.threads_count.max(1);
        info!(
            "[{}] consuming with {} workers, prefetch {}",
            queue, threads, self.config.prefetch_count
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let deliveries = Arc::new(Mutex::new(deliveries));
        let channel = Arc::new(channel);

        let workers = (0..threads)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: queue.clone(),
                    channel: Arc::clone(&channel),
                    deliveries: Arc::clone(&deliveries),
                    handler: Arc::clone(&handler),
                    retry: self.retry.clone(),
                };
                let shutdown = shutdown_rx.clone();
                let fatal = fatal_tx.clone();
                tokio::spawn(async move {
                    let result = worker.run(shutdown).await;
                    if let Err(e) = &result {
                        error!("{}", e);
                        let _ = fatal.send(());
                    }
                    result
                })
            })
            .collect();

        Ok(Some(ConsumerHandle {
            queue,
            connection,
            shutdown: shutdown_tx,
            fatal: fatal_rx,
            workers,
        }))
    }
}

struct Worker {
    id: usize,
    queue: String,
    channel: Arc<Channel>,
    deliveries: Arc<Mutex<lapin::Consumer>>,
    handler: Arc<dyn DeliveryHandler>,
    retry: RetryPolicy,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        debug!("[{}] worker {} started", self.queue, self.id);
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = async { self.deliveries.lock().await.next().await } => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(source)) => {
                    return Err(ConsumerError::Stream {
                        queue: self.queue.clone(),
                        source,
                    });
                }
                None => {
                    warn!("[{}] delivery stream closed", self.queue);
                    break;
                }
            };

            let disposition = self.handler.handle(&delivery.data).await;
            self.settle(delivery.delivery_tag, disposition).await?;
        }
        debug!("[{}] worker {} stopped", self.queue, self.id);
        Ok(())
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), ConsumerError> {
        let what = format!("[{}] {:?} of delivery {}", self.queue, disposition, delivery_tag);
        self.retry
            .run(&what, || async move {
                match disposition {
                    Disposition::Ack => {
                        self.channel
                            .basic_ack(delivery_tag, BasicAckOptions::default())
                            .await
                    }
                    Disposition::Requeue => {
                        self.channel
                            .basic_nack(
                                delivery_tag,
                                BasicNackOptions {
                                    requeue: true,
                                    ..Default::default()
                                },
                            )
                            .await
                    }
                }
            })
            .await
            .map_err(|(attempts, source)| ConsumerError::Acknowledge {
                queue: self.queue.clone(),
                delivery_tag,
                attempts,
                source,
            })
    }
}

/// A running consumer.
pub struct ConsumerHandle {
    queue: String,
    connection: Connection,
    shutdown: watch::Sender<bool>,
    fatal: mpsc::UnboundedReceiver<()>,
    workers: Vec<JoinHandle<Result<(), ConsumerError>>>,
}

impl ConsumerHandle {
    /// The consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits until a worker stops with a fatal error.
    ///
    /// Call [`shutdown`](Self::shutdown) afterwards to collect the error.
    pub async fn failed(&mut self) {
        if self.fatal.recv().await.is_none() {
            // every worker ended cleanly
            std::future::pending::<()>().await;
        }
    }

    /// Waits for every worker to end on its own and returns the first error.
    pub async fn join(self) -> Result<(), ConsumerError> {
        let mut first_error = None;
        for worker in self.workers {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(ConsumerError::Worker(e)),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.connection.close(200, "consumer stopped").await {
            debug!("[{}] closing connection: {}", self.queue, e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops pulling new deliveries, waits for in-flight ones to settle and closes the
    /// connection. Returns the first worker error, if any.
    pub async fn shutdown(self) -> Result<(), ConsumerError> {
        info!("[{}] shutting down", self.queue);
        let _ = self.shutdown.send(true);
        self.join().await
    }
}
