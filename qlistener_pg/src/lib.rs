//! # qlistener postgres store

#![deny(missing_docs)]

/// Cache sources reading the `campaigns` and `subscriptions` tables
pub mod cache_source;

/// Database migrations for the qlistener schema
pub mod migrations;

/// The subscription store implementation for postgres
pub mod store;

pub use cache_source::{PgCampaignSource, PgSubscriptionSource};
pub use migrations::{MIGRATIONS, Migration, MigrationError, Migrator};
pub use store::{PgStore, PgStoreError};
