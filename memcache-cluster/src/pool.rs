//! Bounded per-server connection pool.
//!
//! [`Pool::acquire`] hands out a [`Lease`] on an open, idle connection,
//! connecting a new one while the pool is below its size. When every
//! connection is busy the caller waits for a lease to be dropped.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::connection::{Connection, Reporter};
use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolSettings {
    pub size: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Default)]
struct Slots {
    conns: Vec<Arc<Connection>>,
    /// Connects in progress, counted against the size limit.
    connecting: usize,
}

pub(crate) struct Pool {
    server: Arc<str>,
    settings: PoolSettings,
    slots: Mutex<Slots>,
    available: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
    reaper_started: AtomicBool,
    reporter: Arc<dyn Reporter>,
}

impl Pool {
    pub(crate) fn new(server: &str, settings: PoolSettings, reporter: Arc<dyn Reporter>) -> Arc<Pool> {
        Arc::new(Pool {
            server: Arc::from(server),
            settings: PoolSettings {
                size: settings.size.max(1),
                ..settings
            },
            slots: Mutex::new(Slots::default()),
            available: Notify::new(),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reaper_started: AtomicBool::new(false),
            reporter,
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open connections, busy or not.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots().conns.iter().filter(|c| !c.is_closed()).count()
    }

    /// Get exclusive use of a connection.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Lease, Error> {
        let reservation = loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed {
                    server: self.server.to_string(),
                });
            }

            // register before scanning so a release in between is not lost
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.slots();
                slots.conns.retain(|c| !c.is_closed());
                if let Some(conn) = slots.conns.iter().find(|c| c.try_claim()) {
                    return Ok(Lease {
                        conn: Arc::clone(conn),
                        pool: Arc::clone(self),
                    });
                }
                if slots.conns.len() + slots.connecting < self.settings.size {
                    slots.connecting += 1;
                    break Reservation { pool: self.as_ref() };
                }
            }

            notified.await;
        };

        self.start_reaper();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connected = Connection::connect(
            id,
            Arc::clone(&self.server),
            self.settings.connect_timeout,
            Arc::clone(&self.reporter),
        )
        .await;

        match connected {
            Ok(conn) => {
                let lease = self.admit(conn);
                drop(reservation);
                lease
            }
            Err(error) => {
                self.reporter.connection_failed(&self.server, &error.to_string());
                Err(error)
            }
        }
    }

    /// Add a freshly connected connection, already claimed for the caller.
    /// A pool shut down while the connect was in progress closes it instead.
    fn admit(self: &Arc<Self>, conn: Arc<Connection>) -> Result<Lease, Error> {
        let mut slots = self.slots();
        // checked under the lock: shutdown sets the flag before draining
        if self.closed.load(Ordering::Acquire) {
            drop(slots);
            conn.close();
            return Err(Error::ConnectionClosed {
                server: self.server.to_string(),
            });
        }
        conn.try_claim();
        slots.conns.push(Arc::clone(&conn));
        Ok(Lease {
            conn,
            pool: Arc::clone(self),
        })
    }

    /// Close and forget one connection.
    pub(crate) fn remove(&self, conn: &Connection) {
        conn.close();
        self.slots().conns.retain(|c| c.id() != conn.id());
        self.available.notify_one();
    }

    /// Close every connection. Pending commands fail and waiters give up.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conns = std::mem::take(&mut self.slots().conns);
        debug!(server = %self.server, connections = conns.len(), "pool shutdown");
        for conn in conns {
            conn.close();
        }
        self.available.notify_waiters();
    }

    /// Close connections that have been idle for longer than the idle timeout.
    fn reap_idle(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let mut slots = self.slots();
        let before = slots.conns.len();
        slots.conns.retain(|conn| {
            let expired = !conn.is_busy() && conn.in_flight() == 0 && conn.idle_for() >= idle_timeout;
            if expired {
                conn.close();
            }
            !expired && !conn.is_closed()
        });
        before - slots.conns.len()
    }

    fn start_reaper(self: &Arc<Self>) {
        if self.settings.idle_timeout.is_zero() || self.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::downgrade(self);
        let period = (self.settings.idle_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(reap(pool, period));
    }
}

async fn reap(pool: Weak<Pool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else { return };
        if pool.closed.load(Ordering::Acquire) {
            return;
        }
        let reaped = pool.reap_idle();
        if reaped > 0 {
            debug!(server = %pool.server, reaped, "closed idle connections");
            pool.available.notify_one();
        }
    }
}

/// Gives back the `connecting` count if the connect is abandoned.
struct Reservation<'a> {
    pool: &'a Pool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pool.slots().connecting -= 1;
        self.pool.available.notify_one();
    }
}

/// Exclusive use of a pooled connection until dropped.
pub(crate) struct Lease {
    conn: Arc<Connection>,
    pool: Arc<Pool>,
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.conn.release();
        if self.conn.is_closed() {
            self.pool.remove(&self.conn);
        } else {
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_memcache::{Command, KeyPolicy, Request};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl Reporter for Counting {
        fn connection_failed(&self, _server: &str, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn server_error(&self, _server: &str, _message: &str) {}
    }

    /// Answers every line with `VERSION 1.6.0`.
    async fn version_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        if write.write_all(b"VERSION 1.6.0\r\n").await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn version() -> Command {
        Command::build(Request::Version, &KeyPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn reuses_idle_connection() {
        let (addr, accepted) = version_server().await;
        let pool = Pool::new(&addr, settings(4), Arc::new(Counting::default()));

        for _ in 0..5 {
            let lease = pool.acquire().await.unwrap();
            lease.call(&version()).await.unwrap();
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn grows_to_size_then_waits() {
        let (addr, _) = version_server().await;
        let pool = Pool::new(&addr, settings(2), Arc::new(Counting::default()));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.len(), 2);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let released = first.id();
        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap(), released);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let reporter = Arc::new(Counting::default());
        let pool = Pool::new(&addr, settings(2), reporter.clone());

        let err = pool.acquire().await.err().unwrap();
        assert!(err.is_connection_error());
        assert_eq!(reporter.0.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let (addr, _) = version_server().await;
        let pool = Pool::new(&addr, settings(1), Arc::new(Counting::default()));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.shutdown();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::ConnectionClosed { .. })
        ));
        assert!(held.is_closed());
    }

    #[tokio::test]
    async fn connection_finished_after_shutdown_is_closed() {
        let pool = Pool::new("test:11211", settings(2), Arc::new(Counting::default()));
        let (client, _server) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(
            7,
            Arc::from("test:11211"),
            Box::new(client),
            Duration::from_secs(1),
            Arc::new(Counting::default()),
        );

        pool.shutdown();
        let err = pool.admit(Arc::clone(&conn)).err().unwrap();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
        assert!(conn.is_closed());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn idle_connections_are_reaped() {
        let (addr, _) = version_server().await;
        let pool = Pool::new(
            &addr,
            PoolSettings {
                idle_timeout: Duration::from_millis(30),
                ..settings(2)
            },
            Arc::new(Counting::default()),
        );

        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.len(), 0);
    }
}
