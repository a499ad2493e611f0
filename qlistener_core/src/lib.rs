//! # qlistener core
//!
//! Domain types and the subscription lifecycle engine of the billing ingestion tier:
//! envelope decoding, event dispatch, the lifecycle handlers and the reference caches.
//! Storage and broker specifics live in `qlistener_pg`, `qlistener_mem` and `qlistener_amqp`.

#![deny(missing_docs)]

/// Reference caches and their reload registry
pub mod cache;
/// The shared delivery contract and the MT manager dispatcher
pub mod dispatcher;
/// Envelopes and the closed set of MT manager events
pub mod event;
/// The subscription lifecycle handlers
pub mod lifecycle;
/// Notifications sent to reporting
pub mod notifier;
/// The event payload
pub mod record;
/// The storage seam of the lifecycle handlers
pub mod store;

pub mod prelude {
    //! The prelude module for the `qlistener_core` crate.
    pub use super::cache::{
        CacheError, CacheRegistry, CacheSource, CampaignEntry, ReferenceCache, Reload,
        SubscriptionKey,
    };
    pub use super::dispatcher::{
        ConsumerCounters, CountersSnapshot, DeliveryHandler, Dispatcher, Disposition,
    };
    pub use super::event::{DecodeError, Envelope, EventKind, MtEvent, ValidationError};
    pub use super::lifecycle::{HandlerError, MtManager};
    pub use super::notifier::{Collect, Notifier, NotifierError, NotifyQueue};
    pub use super::record::{Record, status};
    pub use super::store::{AffectedSubscription, NewRetry, NewTransaction, SubscriptionStore};
}
