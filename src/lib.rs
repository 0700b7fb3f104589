//! Resilient content watching over a hierarchical, watch-capable
//! coordination store.
//!
//! A [`ContentWatcher`] keeps an always current copy of one node's content,
//! surviving node creation, mutation and connection loss. It talks to the
//! store through a [`StoreClient`], which reconnects on its own and asks
//! every watcher to resynchronize once the session is back.
//! [`StoreServer`] is an embedded store for tests and local tooling;
//! [`Gateway`] severs and restores the transport to simulate partitions.

mod client;
mod codec;
mod config;
mod errors;
mod gateway;
mod metrics;
mod path;
pub mod proto;
mod server;
pub mod utils;
mod watcher;

pub use client::*;
pub use codec::*;
pub use config::*;
pub use errors::*;
pub use gateway::*;
pub use metrics::*;
pub use path::*;
pub use proto::CreateMode;
pub use proto::Stat;
pub use server::*;
pub use watcher::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
