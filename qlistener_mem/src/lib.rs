//! # qlistener memory store
//!
//! In-memory implementations of the qlistener storage, notifier and cache seams, primarily for
//! testing. Nothing here is durable.

#![deny(missing_docs)]

mod cache_source;
mod notifier;
mod store;

pub use cache_source::*;
pub use notifier::*;
pub use store::*;
