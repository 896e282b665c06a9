//! Async Memcache client for a cluster of independent servers.
//!
//! Keys are mapped to servers with a weighted ketama ring. Each server has a
//! bounded pool of pipelined connections and, once it misbehaves, an issue
//! log that locks it out, probes it, or takes it out of the ring (swapping in
//! a fail-over server when one is configured).
//!
//! Values are typed: strings, numbers, JSON documents and raw bytes each
//! come back as what was stored. See [`Value`].
//!
//! # Example
//!
//! ```no_run
//! use memcache_cluster::{Client, Config, Value};
//!
//! async fn example() -> Result<(), memcache_cluster::Error> {
//!     let client = Client::new(["127.0.0.1:11211", "127.0.0.1:11212"], Config::default());
//!     client.set("hello", "world", Some(100)).await?;
//!     assert_eq!(client.get("hello").await?, Some(Value::from("world")));
//!     client.delete("hello").await?;
//!     client.end();
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
mod error;
mod issues;
mod pool;

pub use client::Client;
pub use config::{Config, Servers};
pub use error::Error;
pub use issues::{Details, Event};
pub use protocol_memcache::{
    CacheItem, ClusterConfig, ClusterNode, GroupedStats, StatValue, StatsMap, Value, Version,
};
