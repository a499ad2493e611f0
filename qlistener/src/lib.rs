//! # qlistener
//!
//! Consumes subscription lifecycle events from the broker into PostgreSQL, keeping the
//! reference caches in sync.

#![deny(missing_docs)]

/// Application configuration
pub mod config;

/// The service context
pub mod service;

pub use config::{AppConfig, ConfigError};
pub use service::{Service, ServiceError};

#[cfg(feature = "in-memory")]
/// In-memory store, notifier and cache sources.
pub mod mem {
    //! Re-exports `qlistener_mem`.
    pub use qlistener_mem::*;
}

pub mod prelude {
    //! The prelude module for the `qlistener` crate.
    pub use qlistener_core::prelude::*;

    pub use super::config::AppConfig;
    pub use super::service::Service;
    pub use qlistener_amqp::{Consumer, ConsumerHandle, QueueConfig, RetryPolicy};
    pub use qlistener_pg::{Migrator, PgStore};

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
}
