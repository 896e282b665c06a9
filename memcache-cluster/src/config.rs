//! Client configuration.
//!
//! A [`Config`] is built once per client and never mutated afterwards. It
//! deserializes with serde; missing fields take their defaults, so a config
//! file only needs to name what it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use protocol_memcache::{DEFAULT_MAX_EXPIRATION, DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN, KeyPolicy};
use serde::Deserialize;

use crate::issues::IssueSettings;

/// Options recognized by [`Client`](crate::Client).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum key size in bytes (default: 250)
    pub max_key_size: usize,
    /// Maximum relative expiration in seconds (default: 30 days)
    pub max_expiration: u32,
    /// Maximum encoded value size in bytes (default: 1MB)
    pub max_value: usize,
    /// Connections per server (default: 10)
    pub pool_size: usize,
    /// Connect and inactivity timeout in milliseconds (default: 5000)
    pub timeout_ms: u64,
    /// Idle connections are closed after this many milliseconds (default: 5000)
    pub idle_timeout_ms: u64,
    /// Failures a server may have before it is marked dead (default: 5)
    #[serde(alias = "retries")]
    pub failures: u32,
    /// How long a failing server is locked out before it is tried again (default: 30000)
    pub retry_ms: u64,
    /// Failures further apart than this start a fresh budget (default: 300000)
    pub failures_timeout_ms: u64,
    /// Interval between reconnection probes of a dead server (default: 60000)
    pub reconnect_ms: u64,
    /// Take dead servers out of the ring instead of probing them (default: false)
    pub remove_on_failure: bool,
    /// Extra servers every write is copied to (default: 0)
    pub redundancy: usize,
    /// Hash keys longer than `max_key_size` instead of rejecting them (default: true)
    pub key_compression: bool,
    /// Prefix prepended to every key (default: empty)
    pub namespace: String,
    /// Expiration in seconds used when a write does not give one (default: 0, never)
    pub default_ttl: u32,
    /// Replacements for servers removed after failure, used in order
    pub fail_over_servers: Vec<String>,
    /// Client-wide ceiling on in-flight commands (default: unlimited)
    pub max_queue_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_key_size: DEFAULT_MAX_KEY_LEN,
            max_expiration: DEFAULT_MAX_EXPIRATION,
            max_value: DEFAULT_MAX_VALUE_LEN,
            pool_size: 10,
            timeout_ms: 5000,
            idle_timeout_ms: 5000,
            failures: 5,
            retry_ms: 30_000,
            failures_timeout_ms: 300_000,
            reconnect_ms: 60_000,
            remove_on_failure: false,
            redundancy: 0,
            key_compression: true,
            namespace: String::new(),
            default_ttl: 0,
            fail_over_servers: Vec::new(),
            max_queue_size: None,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub(crate) fn key_policy(&self) -> KeyPolicy {
        KeyPolicy::new()
            .max_key_len(self.max_key_size)
            .max_value_len(self.max_value)
            .max_expiration(self.max_expiration)
            .compress_keys(self.key_compression)
    }

    pub(crate) fn issue_settings(&self) -> IssueSettings {
        IssueSettings {
            failures: self.failures,
            retry: Duration::from_millis(self.retry_ms),
            failures_timeout: Duration::from_millis(self.failures_timeout_ms),
            reconnect: Duration::from_millis(self.reconnect_ms),
            remove_on_failure: self.remove_on_failure,
        }
    }
}

/// The servers a client starts with.
///
/// Addresses are `host:port`, or a filesystem path for a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Servers {
    Single(String),
    List(Vec<String>),
    /// Address to weight. Heavier servers own more of the ring.
    Weighted(BTreeMap<String, u32>),
}

impl Servers {
    /// `(address, weight)` pairs; unweighted servers have weight 1.
    pub fn weighted(&self) -> Vec<(&str, u32)> {
        match self {
            Servers::Single(addr) => vec![(addr.as_str(), 1)],
            Servers::List(addrs) => addrs.iter().map(|a| (a.as_str(), 1)).collect(),
            Servers::Weighted(map) => map.iter().map(|(a, w)| (a.as_str(), *w)).collect(),
        }
    }
}

impl From<&str> for Servers {
    fn from(addr: &str) -> Self {
        Servers::Single(addr.to_owned())
    }
}

impl From<String> for Servers {
    fn from(addr: String) -> Self {
        Servers::Single(addr)
    }
}

impl From<Vec<String>> for Servers {
    fn from(addrs: Vec<String>) -> Self {
        Servers::List(addrs)
    }
}

impl From<&[&str]> for Servers {
    fn from(addrs: &[&str]) -> Self {
        Servers::List(addrs.iter().map(|a| (*a).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Servers {
    fn from(addrs: [&str; N]) -> Self {
        Servers::from(&addrs[..])
    }
}

impl From<BTreeMap<String, u32>> for Servers {
    fn from(map: BTreeMap<String, u32>) -> Self {
        Servers::Weighted(map)
    }
}

impl<const N: usize> From<[(&str, u32); N]> for Servers {
    fn from(pairs: [(&str, u32); N]) -> Self {
        Servers::Weighted(pairs.iter().map(|(a, w)| ((*a).to_owned(), *w)).collect())
    }
}
