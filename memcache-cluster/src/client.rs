//! The cluster client.
//!
//! [`Client`] owns the ring, one `Pool` per server and the issue logs. A
//! keyed call is namespaced, routed, checked against the in-flight ceiling and
//! the server's availability, then sent over a leased connection. Trouble
//! reported by connections goes through `Tracker` into the issue log, and
//! the resulting events are published to every subscriber.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use ketama::{Ring, RingBuilder};
use protocol_memcache::{
    CacheItem, ClusterConfig, Command, GroupedStats, KeyPolicy, Reply, ReplyError, Request,
    StatsGroup, StatsMap, StorageVerb, Value, Version, compress_key,
};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Servers};
use crate::connection::Reporter;
use crate::error::Error;
use crate::issues::{Action, Details, Event, IssueLog};
use crate::pool::{Pool, PoolSettings};

const EVENT_CAPACITY: usize = 64;

/// Memcache client for a cluster of independent servers.
///
/// Keys are spread over the servers with a weighted ketama ring. Every
/// server gets its own connection pool and, once it has failed, an issue
/// log that decides when it is locked out, probed or removed.
///
/// `Client` is cheap to clone; clones share pools, ring and health state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    policy: KeyPolicy,
    ring: RwLock<Arc<Ring>>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
    issues: Mutex<HashMap<String, IssueLog>>,
    fail_over: Mutex<VecDeque<String>>,
    events: broadcast::Sender<Event>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Client {
    /// Create a client. No connection is opened until the first command.
    pub fn new(servers: impl Into<Servers>, config: Config) -> Client {
        let servers = servers.into();
        let ring = servers
            .weighted()
            .into_iter()
            .fold(RingBuilder::new(), |builder, (addr, weight)| builder.node(addr, weight))
            .build();
        info!(
            servers = ring.node_count(),
            points = ring.point_count(),
            pool_size = config.pool_size,
            "memcache client created"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Client {
            inner: Arc::new(Inner {
                policy: config.key_policy(),
                fail_over: Mutex::new(config.fail_over_servers.iter().cloned().collect()),
                config,
                ring: RwLock::new(Arc::new(ring)),
                pools: Mutex::new(HashMap::new()),
                issues: Mutex::new(HashMap::new()),
                events,
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Servers currently in the ring.
    pub fn servers(&self) -> Vec<String> {
        self.inner
            .ring()
            .nodes()
            .iter()
            .map(|node| node.identity().to_owned())
            .collect()
    }

    /// Subscribe to server lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// The server that owns `key`.
    pub fn route(&self, key: &str) -> Result<String, Error> {
        let wire = self.wire_key(&self.namespaced(key));
        self.inner.route(&wire)
    }

    /// The owner of `key` followed by the servers its writes are copied to.
    pub fn targets(&self, key: &str) -> Result<Vec<String>, Error> {
        let wire = self.wire_key(&self.namespaced(key));
        self.inner.targets(&wire)
    }

    // -- Retrieval ------------------------------------------------------------

    /// Get the value of a key. Returns `None` on a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        let key = self.namespaced(key);
        let command = self.build(Request::Get { key: &key })?;
        let server = self.inner.route(command.key().unwrap_or_default())?;
        self.get_on(&server, &command).await
    }

    /// Get a key from a specific server, bypassing the ring.
    pub async fn get_from(&self, server: &str, key: &str) -> Result<Option<Value>, Error> {
        let key = self.namespaced(key);
        let command = self.build(Request::Get { key: &key })?;
        self.get_on(server, &command).await
    }

    async fn get_on(&self, server: &str, command: &Command) -> Result<Option<Value>, Error> {
        match self.inner.call(server, command).await? {
            Reply::Value(item) => Ok(item.map(|item| item.value)),
            _ => Err(unexpected(server, command)),
        }
    }

    /// Get several keys at once. Misses are absent from the result.
    ///
    /// Keys are grouped by server and each group is fetched with one
    /// multi-key `get`; the groups run concurrently.
    pub async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Value>, Error> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let ring = self.inner.ring();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let key = self.namespaced(key);
            let server = ring
                .route(self.wire_key(&key).as_bytes())
                .ok_or(Error::NoServers)?;
            groups.entry(server.to_owned()).or_default().push(key);
        }

        let mut tasks = JoinSet::new();
        for (server, keys) in groups {
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move { inner.fetch(&server, &keys).await });
        }

        let namespace = &self.inner.config.namespace;
        let mut found = HashMap::with_capacity(keys.len());
        while let Some(joined) = tasks.join_next().await {
            for (key, value) in joined_result(joined)?? {
                let key = match key.strip_prefix(namespace.as_str()) {
                    Some(stripped) => stripped.to_owned(),
                    None => key,
                };
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Get a value with its CAS token.
    pub async fn gets(&self, key: &str) -> Result<Option<(Value, u64)>, Error> {
        let key = self.namespaced(key);
        let command = self.build(Request::Gets {
            keys: &[key.as_str()],
        })?;
        let server = self.inner.route(command.key().unwrap_or_default())?;
        match self.inner.call(&server, &command).await? {
            Reply::Values(items) => Ok(items
                .into_iter()
                .next()
                .and_then(|item| item.cas.map(|cas| (item.value, cas)))),
            _ => Err(unexpected(&server, &command)),
        }
    }

    // -- Storage --------------------------------------------------------------

    /// Store a value. `ttl` of `None` uses the configured default.
    pub async fn set(&self, key: &str, value: impl Into<Value>, ttl: Option<u32>) -> Result<bool, Error> {
        self.store(StorageVerb::Set, key, value.into(), ttl).await
    }

    /// Store a value only if the key does not exist.
    pub async fn add(&self, key: &str, value: impl Into<Value>, ttl: Option<u32>) -> Result<bool, Error> {
        self.store(StorageVerb::Add, key, value.into(), ttl).await
    }

    /// Store a value only if the key already exists.
    pub async fn replace(&self, key: &str, value: impl Into<Value>, ttl: Option<u32>) -> Result<bool, Error> {
        self.store(StorageVerb::Replace, key, value.into(), ttl).await
    }

    pub async fn append(&self, key: &str, value: impl Into<Value>) -> Result<bool, Error> {
        self.store(StorageVerb::Append, key, value.into(), None).await
    }

    pub async fn prepend(&self, key: &str, value: impl Into<Value>) -> Result<bool, Error> {
        self.store(StorageVerb::Prepend, key, value.into(), None).await
    }

    /// Store a value only if nobody else wrote the key since `cas` was read.
    pub async fn cas(
        &self,
        key: &str,
        value: impl Into<Value>,
        cas: u64,
        ttl: Option<u32>,
    ) -> Result<bool, Error> {
        let key = self.namespaced(key);
        let value = value.into();
        let payload = value.encode();
        let exptime = self.ttl(ttl);
        let reply = self
            .write(|noreply| Request::Cas {
                key: &key,
                value: &payload,
                flags: value.flags(),
                exptime,
                cas_unique: cas,
                noreply,
            })
            .await?;
        Ok(matches!(reply, Reply::Done(true)))
    }

    async fn store(&self, verb: StorageVerb, key: &str, value: Value, ttl: Option<u32>) -> Result<bool, Error> {
        let key = self.namespaced(key);
        let payload = value.encode();
        let exptime = self.ttl(ttl);
        let reply = self
            .write(|noreply| Request::Store {
                verb,
                key: &key,
                value: &payload,
                flags: value.flags(),
                exptime,
                noreply,
            })
            .await?;
        Ok(matches!(reply, Reply::Done(true)))
    }

    /// Increment a numeric value. Returns `None` if the key does not exist.
    pub async fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>, Error> {
        let key = self.namespaced(key);
        self.arithmetic(|noreply| Request::Incr {
            key: &key,
            delta,
            noreply,
        })
        .await
    }

    /// Decrement a numeric value, stopping at zero. Returns `None` if the key
    /// does not exist.
    pub async fn decr(&self, key: &str, delta: u64) -> Result<Option<u64>, Error> {
        let key = self.namespaced(key);
        self.arithmetic(|noreply| Request::Decr {
            key: &key,
            delta,
            noreply,
        })
        .await
    }

    async fn arithmetic<'k>(&self, build: impl Fn(bool) -> Request<'k>) -> Result<Option<u64>, Error> {
        match self.write(build).await? {
            Reply::Numeric(n) => Ok(n),
            _ => Ok(None),
        }
    }

    /// Delete a key. Returns `false` if it did not exist.
    pub async fn delete(&self, key: &str) -> Result<bool, Error> {
        let key = self.namespaced(key);
        let reply = self
            .write(|noreply| Request::Delete { key: &key, noreply })
            .await?;
        Ok(matches!(reply, Reply::Done(true)))
    }

    /// Update a key's expiration without fetching it.
    pub async fn touch(&self, key: &str, ttl: u32) -> Result<bool, Error> {
        let key = self.namespaced(key);
        let reply = self
            .write(|noreply| Request::Touch {
                key: &key,
                exptime: ttl,
                noreply,
            })
            .await?;
        Ok(matches!(reply, Reply::Done(true)))
    }

    /// Send a keyed write to its owner and, with redundancy configured,
    /// a `noreply` copy to the next servers on the ring.
    async fn write<'k>(&self, build: impl Fn(bool) -> Request<'k>) -> Result<Reply, Error> {
        let command = self.build(build(false))?;
        let targets = self.inner.targets(command.key().unwrap_or_default())?;
        let (primary, replicas) = targets.split_first().ok_or(Error::NoServers)?;

        if !replicas.is_empty() {
            let copy = self.build(build(true))?;
            for server in replicas {
                self.inner.replicate(server.clone(), copy.clone());
            }
        }
        self.inner.call(primary, &command).await
    }

    // -- Introspection --------------------------------------------------------

    /// `stats` from every server.
    pub async fn stats(&self) -> Result<BTreeMap<String, Result<StatsMap, Error>>, Error> {
        self.each_server(Request::Stats(StatsGroup::General), |reply| match reply {
            Reply::Stats(stats) => Some(stats),
            _ => None,
        })
        .await
    }

    /// `stats settings` from every server.
    pub async fn stats_settings(&self) -> Result<BTreeMap<String, Result<StatsMap, Error>>, Error> {
        self.each_server(Request::Stats(StatsGroup::Settings), |reply| match reply {
            Reply::Stats(stats) => Some(stats),
            _ => None,
        })
        .await
    }

    /// `stats slabs` from every server, grouped by slab class.
    pub async fn stats_slabs(&self) -> Result<BTreeMap<String, Result<GroupedStats, Error>>, Error> {
        self.each_server(Request::Stats(StatsGroup::Slabs), |reply| match reply {
            Reply::Grouped(stats) => Some(stats),
            _ => None,
        })
        .await
    }

    /// `stats items` from every server, grouped by slab class.
    pub async fn stats_items(&self) -> Result<BTreeMap<String, Result<GroupedStats, Error>>, Error> {
        self.each_server(Request::Stats(StatsGroup::Items), |reply| match reply {
            Reply::Grouped(stats) => Some(stats),
            _ => None,
        })
        .await
    }

    /// Invalidate every item on every server.
    pub async fn flush(&self) -> Result<BTreeMap<String, Result<bool, Error>>, Error> {
        self.each_server(Request::FlushAll, |reply| match reply {
            Reply::Done(done) => Some(done),
            _ => None,
        })
        .await
    }

    /// Version of every server.
    pub async fn version(&self) -> Result<BTreeMap<String, Result<Version, Error>>, Error> {
        self.each_server(Request::Version, |reply| match reply {
            Reply::Version(version) => Some(version),
            _ => None,
        })
        .await
    }

    /// List up to `limit` items of one slab class on one server.
    pub async fn cachedump(&self, server: &str, slab: u32, limit: u32) -> Result<Vec<CacheItem>, Error> {
        let command = self.build(Request::Cachedump { slab, limit })?;
        match self.inner.call(server, &command).await? {
            Reply::Items(items) => Ok(items),
            _ => Err(unexpected(server, &command)),
        }
    }

    /// Ask a configuration endpoint for the current cluster membership.
    pub async fn cluster_config(&self, server: &str) -> Result<ClusterConfig, Error> {
        let command = self.build(Request::ConfigGet)?;
        match self.inner.call(server, &command).await? {
            Reply::Config(config) => Ok(config),
            _ => Err(unexpected(server, &command)),
        }
    }

    async fn each_server<T: Send + 'static>(
        &self,
        request: Request<'static>,
        extract: fn(Reply) -> Option<T>,
    ) -> Result<BTreeMap<String, Result<T, Error>>, Error> {
        let command = self.build(request)?;
        let servers = self.servers();
        if servers.is_empty() {
            return Err(Error::NoServers);
        }

        let mut tasks = JoinSet::new();
        for server in servers {
            let inner = Arc::clone(&self.inner);
            let command = command.clone();
            tasks.spawn(async move {
                let result = inner.call(&server, &command).await.and_then(|reply| {
                    extract(reply).ok_or_else(|| unexpected(&server, &command))
                });
                (server, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (server, result) = joined_result(joined)?;
            results.insert(server, result);
        }
        Ok(results)
    }

    // -- Lifecycle ------------------------------------------------------------

    /// Close every connection. Commands in flight fail with a connection
    /// error and later calls fail with [`Error::Shutdown`].
    pub fn end(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<Arc<Pool>> = lock(&self.inner.pools).drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
        }
        info!("memcache client shut down");
    }

    // -- Helpers --------------------------------------------------------------

    fn build(&self, request: Request<'_>) -> Result<Command, Error> {
        Ok(Command::build(request, &self.inner.policy)?)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.namespace, key)
    }

    /// The key as it will appear on the wire.
    fn wire_key(&self, key: &str) -> String {
        let config = &self.inner.config;
        if config.key_compression && key.len() > config.max_key_size {
            compress_key(key)
        } else {
            key.to_owned()
        }
    }

    fn ttl(&self, ttl: Option<u32>) -> u32 {
        ttl.unwrap_or(self.inner.config.default_ttl)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("servers", &self.servers())
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl Inner {
    fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn route(&self, wire_key: &str) -> Result<String, Error> {
        self.ring()
            .route(wire_key.as_bytes())
            .map(str::to_owned)
            .ok_or(Error::NoServers)
    }

    fn targets(&self, wire_key: &str) -> Result<Vec<String>, Error> {
        let targets: Vec<String> = self
            .ring()
            .route_range(wire_key.as_bytes(), 1 + self.config.redundancy, true)
            .into_iter()
            .map(str::to_owned)
            .collect();
        if targets.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(targets)
    }

    /// Send a command and assemble its reply.
    async fn call(self: &Arc<Self>, server: &str, command: &Command) -> Result<Reply, Error> {
        let caller_key = command.key().map(|key| command.caller_key(key).to_owned());
        let with_key = |e: Error| match &caller_key {
            Some(key) => e.with_key(key),
            None => e,
        };

        let frame = self.execute(server, command).await.map_err(with_key)?;
        match frame {
            None => Ok(Reply::Done(true)),
            Some(frame) => Reply::assemble(command.kind(), frame).map_err(|source| Error::Protocol {
                server: server.to_owned(),
                key: caller_key.clone(),
                source,
            }),
        }
    }

    async fn execute(
        self: &Arc<Self>,
        server: &str,
        command: &Command,
    ) -> Result<Option<protocol_memcache::Frame>, Error> {
        let _slot = self.reserve()?;
        if !self.is_available(server) {
            return Err(Error::Unavailable {
                server: server.to_owned(),
            });
        }
        let pool = self.pool(server)?;
        let lease = pool.acquire().await?;
        lease.call(command).await
    }

    /// Multi-key fetch from one server, keyed by the caller's key.
    async fn fetch(self: &Arc<Self>, server: &str, keys: &[String]) -> Result<Vec<(String, Value)>, Error> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let command = Command::build(Request::GetMulti { keys: &refs }, &self.policy)?;
        match self.call(server, &command).await? {
            Reply::Values(items) => Ok(items
                .into_iter()
                .map(|item| (command.caller_key(&item.key).to_owned(), item.value))
                .collect()),
            _ => Err(unexpected(server, &command)),
        }
    }

    /// Fire-and-forget copy of a write.
    fn replicate(self: &Arc<Self>, server: String, command: Command) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = inner.execute(&server, &command).await {
                debug!(server = %server, error = %error, "redundant write dropped");
            }
        });
    }

    fn reserve(&self) -> Result<InFlight<'_>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlight(&self.in_flight);
        if let Some(limit) = self.config.max_queue_size
            && previous >= limit
        {
            return Err(Error::QueueLimit { limit });
        }
        Ok(slot)
    }

    fn is_available(&self, server: &str) -> bool {
        lock(&self.issues)
            .get(server)
            .is_none_or(|log| log.is_available(Instant::now()))
    }

    fn pool(self: &Arc<Self>, server: &str) -> Result<Arc<Pool>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let mut pools = lock(&self.pools);
        let pool = pools.entry(server.to_owned()).or_insert_with(|| {
            let settings = PoolSettings {
                size: self.config.pool_size,
                connect_timeout: self.config.timeout(),
                idle_timeout: self.config.idle_timeout(),
            };
            Pool::new(server, settings, Arc::new(Tracker(Arc::downgrade(self))))
        });
        Ok(Arc::clone(pool))
    }

    fn publish(&self, event: Event) {
        let details = event.details();
        match &event {
            Event::Issue(_) => warn!(
                server = %details.server,
                failures_left = details.failures_left,
                "server issue"
            ),
            Event::Failure(_) => error!(
                server = %details.server,
                total_failures = details.total_failures,
                "server marked as failed"
            ),
            Event::Reconnecting(_) => info!(
                server = %details.server,
                attempt = details.reconnect_attempts,
                "reconnecting"
            ),
            Event::Reconnected(_) => info!(server = %details.server, "server reconnected"),
            Event::Remove(_) => warn!(
                server = %details.server,
                replaced_by = ?details.replaced_by,
                "server removed"
            ),
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn with_log<T>(&self, server: &str, f: impl FnOnce(&mut IssueLog) -> T) -> Option<T> {
        lock(&self.issues).get_mut(server).map(f)
    }

    fn record_failure(self: &Arc<Self>, server: &str, message: &str) {
        if self.closed.load(Ordering::Acquire) || !self.ring().contains(server) {
            return;
        }
        let (transition, details) = {
            let mut issues = lock(&self.issues);
            let log = issues
                .entry(server.to_owned())
                .or_insert_with(|| IssueLog::new(server, self.config.issue_settings()));
            let transition = log.record(message, Instant::now());
            (transition, log.details())
        };

        for event in transition.events {
            self.publish(event);
        }
        match transition.action {
            Some(Action::Remove) => self.remove_server(server, details),
            Some(Action::Reconnect(every)) => self.spawn_reconnect(server.to_owned(), every),
            None => {}
        }
    }

    /// Take a dead server out of the ring, or swap in a fail-over server.
    fn remove_server(&self, server: &str, mut details: Details) {
        let replacement = {
            let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
            if !ring.contains(server) {
                return;
            }
            let replacement = lock(&self.fail_over).pop_front();
            let next = match &replacement {
                Some(new) => ring.swapped(server, new),
                None => ring.without(server),
            };
            *ring = Arc::new(next);
            replacement
        };

        if let Some(pool) = lock(&self.pools).remove(server) {
            pool.shutdown();
        }
        lock(&self.issues).remove(server);

        details.replaced_by = replacement;
        self.publish(Event::Remove(details));
    }

    /// Probe a dead server with `version` until it answers.
    fn spawn_reconnect(self: &Arc<Self>, server: String, every: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(inner) = weak.upgrade() else { return };
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                let Some(attempt) = inner.with_log(&server, IssueLog::reconnect_attempt) else {
                    return;
                };
                inner.publish(attempt);

                match inner.probe(&server).await {
                    Ok(()) => {
                        if let Some(event) = inner.with_log(&server, IssueLog::reconnected) {
                            inner.publish(event);
                        }
                        return;
                    }
                    Err(error) => {
                        debug!(server = %server, error = %error, "reconnect probe failed");
                        // transport errors already reached the log through the pool
                        if !error.is_connection_error() {
                            inner.with_log(&server, |log| log.reconnect_failed(&error.to_string()));
                        }
                    }
                }
            }
        });
    }

    async fn probe(self: &Arc<Self>, server: &str) -> Result<(), Error> {
        let command = Command::build(Request::Version, &self.policy)?;
        let pool = self.pool(server)?;
        let lease = pool.acquire().await?;
        lease.call(&command).await.map(|_| ())
    }
}

/// Routes connection trouble into the owning client's issue logs.
struct Tracker(Weak<Inner>);

impl Reporter for Tracker {
    fn connection_failed(&self, server: &str, message: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.record_failure(server, message);
        }
    }

    fn server_error(&self, server: &str, message: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.record_failure(server, message);
        }
    }
}

/// Counts one command against the in-flight ceiling until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn unexpected(server: &str, command: &Command) -> Error {
    Error::Protocol {
        server: server.to_owned(),
        key: command.key().map(|key| command.caller_key(key).to_owned()),
        source: ReplyError::Unexpected(command.kind().name()),
    }
}

fn joined_result<T>(joined: Result<T, JoinError>) -> Result<T, Error> {
    match joined {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Shutdown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(config: Config) -> Client {
        Client::new(["10.0.0.1:11211", "10.0.0.2:11211", "10.0.0.3:11211"], config)
    }

    #[test]
    fn routing_is_stable() {
        let client = cluster(Config::default());
        let first = client.route("user:42").unwrap();
        for _ in 0..10 {
            assert_eq!(client.route("user:42").unwrap(), first);
        }
        assert_eq!(client.servers().len(), 3);
    }

    #[test]
    fn namespace_changes_routing_key() {
        let plain = cluster(Config::default());
        let spaced = cluster(Config {
            namespace: "app:".into(),
            ..Config::default()
        });
        assert_eq!(spaced.route("k").unwrap(), plain.route("app:k").unwrap());
    }

    #[test]
    fn long_keys_route_by_digest() {
        let client = cluster(Config::default());
        let long = "x".repeat(300);
        assert_eq!(client.wire_key(&long), compress_key(&long));
        assert_eq!(client.wire_key("short"), "short");
        assert_eq!(client.route(&long).unwrap(), client.inner.route(&compress_key(&long)).unwrap());
    }

    #[test]
    fn redundancy_targets_distinct_servers() {
        let client = cluster(Config {
            redundancy: 1,
            ..Config::default()
        });
        let targets = client.targets("r").unwrap();
        assert_eq!(targets.len(), 2);
        assert_ne!(targets[0], targets[1]);
        assert_eq!(targets[0], client.route("r").unwrap());
    }

    #[test]
    fn empty_cluster_has_no_route() {
        let client = Client::new(Servers::List(vec![]), Config::default());
        assert!(matches!(client.route("k"), Err(Error::NoServers)));
    }

    #[test]
    fn queue_limit_fails_fast() {
        let client = cluster(Config {
            max_queue_size: Some(1),
            ..Config::default()
        });
        let held = client.inner.reserve().unwrap();
        assert!(matches!(
            client.inner.reserve(),
            Err(Error::QueueLimit { limit: 1 })
        ));
        drop(held);
        assert!(client.inner.reserve().is_ok());
        assert_eq!(client.inner.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removal_swaps_in_fail_over_server() {
        let client = cluster(Config {
            fail_over_servers: vec!["10.0.0.9:11211".into()],
            ..Config::default()
        });
        let mut events = client.events();
        let details = IssueLog::new("10.0.0.2:11211", client.config().issue_settings()).details();

        client.inner.remove_server("10.0.0.2:11211", details);

        let servers = client.servers();
        assert!(servers.contains(&"10.0.0.9:11211".to_string()));
        assert!(!servers.contains(&"10.0.0.2:11211".to_string()));
        match events.try_recv().unwrap() {
            Event::Remove(d) => assert_eq!(d.replaced_by.as_deref(), Some("10.0.0.9:11211")),
            other => panic!("unexpected {other:?}"),
        }

        // the fail-over list is used up: the next removal shrinks the ring
        let details = IssueLog::new("10.0.0.1:11211", client.config().issue_settings()).details();
        client.inner.remove_server("10.0.0.1:11211", details);
        assert_eq!(client.servers().len(), 2);
    }

    #[test]
    fn end_rejects_new_commands() {
        let client = cluster(Config::default());
        client.end();
        assert!(matches!(client.inner.reserve(), Err(Error::Shutdown)));
    }
}
