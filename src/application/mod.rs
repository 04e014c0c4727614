//! Application services: the feed store and everything that mutates it.

pub mod context;
pub mod coordinator;
pub mod error;
pub mod feed_store;
pub mod listener;
pub(crate) mod lock;
pub mod ports;
pub mod workflow;
