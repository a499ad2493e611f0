//! The subscription lifecycle handlers ("MT manager").
//!
//! Each handler turns a [`Record`] into one store mutation and, for some events, a notification
//! to reporting. Storage errors are returned so the dispatcher can requeue the message;
//! notification errors are only logged.

use crate::event::{EventKind, MtEvent};
use crate::notifier::{Collect, Notifier, NotifyQueue};
use crate::record::{DEFAULT_PURGE_REASON, Record, status};
use crate::store::{NewRetry, NewTransaction, SubscriptionStore};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Instant;

/// Errors returned by the lifecycle handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError<E>
where
    E: std::error::Error + 'static,
{
    /// The record can never satisfy the handler's precondition
    #[error("{event} rejected: {reason}")]
    Rejected {
        /// The event that was rejected
        event: EventKind,
        /// Why it was rejected
        reason: String,
    },
    /// The store failed
    #[error("storage error: {0}")]
    Storage(#[source] E),
}

impl<E> HandlerError<E>
where
    E: std::error::Error + 'static,
{
    /// Whether redelivering the same message may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Storage(_))
    }
}

/// Applies MT manager events to a [`SubscriptionStore`].
pub struct MtManager<S> {
    store: S,
    notifier: Arc<dyn Notifier>,
}

impl<S> MtManager<S>
where
    S: SubscriptionStore,
{
    /// Creates a new manager writing to `store` and reporting through `notifier`.
    pub fn new(store: S, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Routes an event to its handler.
    pub async fn handle(&self, event: &MtEvent) -> Result<(), HandlerError<S::Error>> {
        let begin = Instant::now();
        let record = event.record();
        let result = match event {
            MtEvent::StartRetry(r) => self.start_retry(r).await,
            MtEvent::TouchRetry(r) => self.touch_retry(r).await,
            MtEvent::RemoveRetry(r) => self.remove_retry(r).await,
            MtEvent::WriteSubscriptionStatus(r) => self.write_subscription_status(r).await,
            MtEvent::WriteSubscriptionPeriodic(r) => self.write_subscription_periodic(r).await,
            MtEvent::Unsubscribe(r) => self.unsubscribe(r).await,
            MtEvent::UnsubscribeAll(r) => self.unsubscribe_all(r).await,
            MtEvent::AddBlacklistedNumber(r) => self.add_blacklisted_number(r).await,
            MtEvent::AddPostPaidNumber(r) => self.add_postpaid_number(r).await,
            MtEvent::WriteTransaction(r) => self.write_transaction(r).await,
        };
        match &result {
            Ok(_) => debug!(
                "{} tid={} msisdn={} took {:?}",
                event.kind(),
                record.tid,
                record.msisdn,
                begin.elapsed()
            ),
            Err(e) => error!(
                "{} tid={} failed after {:?}: {}; record: {:?}",
                event.kind(),
                record.tid,
                begin.elapsed(),
                e,
                record
            ),
        }
        result
    }

    /// Schedules a new retry. Both `keep_days` and `delay_hours` must be positive.
    pub async fn start_retry(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        if r.keep_days <= 0 {
            return Err(HandlerError::Rejected {
                event: EventKind::StartRetry,
                reason: format!("retry keep days required, service id: {}", r.service_code),
            });
        }
        if r.delay_hours <= 0 {
            return Err(HandlerError::Rejected {
                event: EventKind::StartRetry,
                reason: format!("retry delay hours required, service id: {}", r.service_code),
            });
        }
        let id = self
            .store
            .insert_retry(&NewRetry::from(r))
            .await
            .map_err(HandlerError::Storage)?;
        debug!("Retry {} scheduled for tid={}", id, r.tid);
        Ok(())
    }

    /// Records a billing attempt on a retry.
    pub async fn touch_retry(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        let touched = self
            .store
            .touch_retry(r.retry_id, r.attempted_at())
            .await
            .map_err(HandlerError::Storage)?;
        if touched == 0 {
            warn!("TouchRetry tid={}: no retry with id {}", r.tid, r.retry_id);
        }
        Ok(())
    }

    /// Deletes a retry, archiving it as expired unless the caller says it was paid.
    pub async fn remove_retry(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        let archive = r.subscription_status != status::PAID;
        let removed = self
            .store
            .remove_retry(r.retry_id, archive)
            .await
            .map_err(HandlerError::Storage)?;
        if removed == 0 {
            warn!("RemoveRetry tid={}: no retry with id {}", r.tid, r.retry_id);
        }
        Ok(())
    }

    /// Sets a subscription's status and reports it as an outflow event.
    pub async fn write_subscription_status(
        &self,
        r: &Record,
    ) -> Result<(), HandlerError<S::Error>> {
        let new_status = r.subscription_status.as_str();
        self.store
            .write_subscription_status(r.subscription_id, new_status, r.attempted_at())
            .await
            .map_err(HandlerError::Storage)?;

        self.notify(
            NotifyQueue::Outflow,
            Collect {
                tid: r.tid.clone(),
                campaign_code: r.campaign_code.clone(),
                operator_code: r.operator_code,
                msisdn: r.msisdn.clone(),
                price: r.price,
                transaction_result: new_status.to_string(),
                attempts_count: r.attempts_count,
            },
        )
        .await;
        Ok(())
    }

    /// Sets a subscription's periodic flag.
    pub async fn write_subscription_periodic(
        &self,
        r: &Record,
    ) -> Result<(), HandlerError<S::Error>> {
        self.store
            .write_subscription_periodic(r.subscription_id, r.periodic)
            .await
            .map_err(HandlerError::Storage)?;
        Ok(())
    }

    /// Cancels the latest active subscription of the msisdn to the service.
    ///
    /// The outflow event names the canceled subscription's campaign and operator and the
    /// caller's attempt count.
    pub async fn unsubscribe(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        let canceled = self
            .store
            .unsubscribe(&r.msisdn, &r.service_code, r.attempted_at())
            .await
            .map_err(HandlerError::Storage)?;

        let Some(subscription) = canceled else {
            debug!(
                "Unsubscribe tid={}: nothing to cancel for {} on service {}",
                r.tid, r.msisdn, r.service_code
            );
            return Ok(());
        };

        self.notify(
            NotifyQueue::Outflow,
            Collect {
                tid: r.tid.clone(),
                campaign_code: subscription.campaign_code,
                operator_code: subscription.operator_code,
                msisdn: r.msisdn.clone(),
                price: r.price,
                transaction_result: status::CANCELED.to_string(),
                attempts_count: r.attempts_count,
            },
        )
        .await;
        Ok(())
    }

    /// Purges every active subscription of the msisdn.
    pub async fn unsubscribe_all(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        let reason = if r.outflow_reason.is_empty() {
            DEFAULT_PURGE_REASON
        } else {
            r.outflow_reason.as_str()
        };
        let purged = self
            .store
            .unsubscribe_all(&r.msisdn, reason, r.attempted_at())
            .await
            .map_err(HandlerError::Storage)?;

        if purged.is_empty() {
            debug!("UnsubscribeAll tid={}: nothing to purge for {}", r.tid, r.msisdn);
        }
        for subscription in purged {
            self.notify(
                NotifyQueue::Outflow,
                Collect {
                    tid: r.tid.clone(),
                    campaign_code: subscription.campaign_code,
                    operator_code: subscription.operator_code,
                    msisdn: r.msisdn.clone(),
                    price: r.price,
                    transaction_result: status::PURGED.to_string(),
                    attempts_count: subscription.attempts_count,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Adds the msisdn to the blacklist.
    pub async fn add_blacklisted_number(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        self.store
            .add_blacklisted_number(&r.msisdn)
            .await
            .map_err(HandlerError::Storage)
    }

    /// Adds the msisdn to the postpaid list.
    pub async fn add_postpaid_number(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        self.store
            .add_postpaid_number(&r.msisdn)
            .await
            .map_err(HandlerError::Storage)
    }

    /// Appends the billing transaction and reports it as collected.
    pub async fn write_transaction(&self, r: &Record) -> Result<(), HandlerError<S::Error>> {
        self.store
            .insert_transaction(&NewTransaction::from(r))
            .await
            .map_err(HandlerError::Storage)?;

        self.notify(
            NotifyQueue::Transaction,
            Collect {
                tid: r.tid.clone(),
                campaign_code: r.campaign_code.clone(),
                operator_code: r.operator_code,
                msisdn: r.msisdn.clone(),
                price: r.price,
                transaction_result: r.result.clone(),
                attempts_count: r.attempts_count,
            },
        )
        .await;
        Ok(())
    }

    async fn notify(&self, queue: NotifyQueue, event: Collect) {
        let tid = event.tid.clone();
        if let Err(e) = self.notifier.publish(queue, event).await {
            warn!("Failed to notify {:?} for tid={}: {}", queue, tid, e);
        }
    }
}
