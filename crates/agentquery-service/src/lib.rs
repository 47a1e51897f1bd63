//! A client-side query layer for the agents API.
//!
//! Queries are described by the [`definitions::Registry`] and run through a
//! [`client::QueryClient`], which deduplicates concurrent fetches, caches their results with
//! staleness and retention windows, gates queries on the state of other cache entries, and
//! accumulates paginated listings.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod definitions;
pub mod enablement;
pub mod http;
pub mod logging;
pub mod pagination;
pub mod service;
pub mod utils;

pub use client::{InfiniteQuery, QueryClient, QueryConfig, QueryObserver};
