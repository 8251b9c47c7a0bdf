//! Polling data-collection agent.
//!
//! Pollers pull windows of records from source plugins, keep each other
//! within a bounded spread of source time through a shared sync barrier and
//! forward what they collect to an analytics backend over a framed TCP
//! protocol with server-driven back pressure.

pub mod collect;
pub mod config;
pub mod export;
pub mod manager;
pub mod plugin;
pub mod poller;
pub mod query;
pub mod sync;
pub mod transport;
