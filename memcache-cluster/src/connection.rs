//! One pipelined connection to one server.
//!
//! Writes go through a mutex-guarded write half. Each command that expects a
//! reply pushes a slot onto the pending FIFO while the write lock is held, so
//! FIFO order always equals wire order. A reader task owns the read half and
//! the [`ResponseParser`], and resolves slots oldest first.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use protocol_memcache::{Command, Frame, ResponseParser};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};

use crate::error::Error;

const READ_CHUNK: usize = 16 * 1024;

/// Where a connection reports trouble with its server.
pub(crate) trait Reporter: Send + Sync + 'static {
    /// The transport failed. Called at most once per connection.
    fn connection_failed(&self, server: &str, message: &str);

    /// The server replied `SERVER_ERROR`. The connection stays open.
    fn server_error(&self, server: &str, message: &str);
}

type Slot = oneshot::Sender<Result<Frame, Error>>;

struct Pending {
    slot: Slot,
    issued_at: Instant,
}

/// State shared between callers and the reader task.
struct Shared {
    id: u64,
    server: Arc<str>,
    timeout: Duration,
    pending: Mutex<VecDeque<Pending>>,
    closed: AtomicBool,
    shutdown: Notify,
    last_used: Mutex<Instant>,
    reporter: Arc<dyn Reporter>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a slot unless the connection is already closed. Checked under the
    /// queue lock so a concurrent drain cannot miss the new slot.
    fn enqueue(&self) -> Option<oneshot::Receiver<Result<Frame, Error>>> {
        let mut pending = self.pending();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let (slot, receiver) = oneshot::channel();
        pending.push_back(Pending {
            slot,
            issued_at: Instant::now(),
        });
        Some(receiver)
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Transport failure: report once, then fail everything in flight.
    fn fail(&self, error: Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(server = %self.server, conn = self.id, error = %error, "connection failed");
        self.reporter.connection_failed(&self.server, &error.to_string());
        self.drain(&error);
        self.shutdown.notify_one();
    }

    /// Local close: fail everything in flight without reporting.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(server = %self.server, conn = self.id, "closing connection");
        self.drain(&Error::ConnectionClosed {
            server: self.server.to_string(),
        });
        self.shutdown.notify_one();
    }

    fn drain(&self, error: &Error) {
        let pending = std::mem::take(&mut *self.pending());
        for p in pending {
            let _ = p.slot.send(Err(replicate(error)));
        }
    }
}

/// A fresh copy of a connection-level error for each pending command.
fn replicate(error: &Error) -> Error {
    match error {
        Error::Connection { server, source } => Error::Connection {
            server: server.clone(),
            source: io::Error::new(source.kind(), source.to_string()),
        },
        Error::Timeout { server, after } => Error::Timeout {
            server: server.clone(),
            after: *after,
        },
        other => Error::ConnectionClosed {
            server: other.server().unwrap_or_default().to_owned(),
        },
    }
}

pub(crate) struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn Stream>>>,
    busy: AtomicBool,
}

/// Any full-duplex byte stream.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

impl Connection {
    /// Connect to `server`: a filesystem path means a Unix socket, anything
    /// else is a TCP `host:port` with `TCP_NODELAY` set.
    pub(crate) async fn connect(
        id: u64,
        server: Arc<str>,
        timeout: Duration,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Arc<Connection>, Error> {
        let stream = tokio::time::timeout(timeout, open(&server))
            .await
            .map_err(|_| Error::Timeout {
                server: server.to_string(),
                after: timeout,
            })?
            .map_err(|source| Error::Connection {
                server: server.to_string(),
                source,
            })?;
        debug!(server = %server, conn = id, "connected");
        Ok(Self::from_stream(id, server, stream, timeout, reporter))
    }

    /// Wrap an established stream and spawn its reader task.
    pub(crate) fn from_stream(
        id: u64,
        server: Arc<str>,
        stream: Box<dyn Stream>,
        timeout: Duration,
        reporter: Arc<dyn Reporter>,
    ) -> Arc<Connection> {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            id,
            server,
            timeout,
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_used: Mutex::new(Instant::now()),
            reporter,
        });
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Arc::new(Connection {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            busy: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Commands written but not yet answered.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.pending().len()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.shared
            .last_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Claim the connection for one caller. See [`Connection::release`].
    pub(crate) fn try_claim(&self) -> bool {
        !self.is_closed()
            && self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.shared.close();
    }

    /// Write `command` and wait for its reply.
    ///
    /// Returns `Ok(None)` for `noreply` commands as soon as the bytes are
    /// written.
    pub(crate) async fn call(&self, command: &Command) -> Result<Option<Frame>, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed {
                server: self.shared.server.to_string(),
            });
        }

        let receiver = {
            let mut writer = self.writer.lock().await;
            let receiver = if command.noreply() {
                None
            } else {
                match self.shared.enqueue() {
                    Some(receiver) => Some(receiver),
                    None => {
                        return Err(Error::ConnectionClosed {
                            server: self.shared.server.to_string(),
                        });
                    }
                }
            };

            let mut guard = WriteGuard {
                shared: &self.shared,
                done: false,
            };
            let written = async {
                writer.write_all(command.wire()).await?;
                writer.flush().await
            }
            .await;
            guard.done = true;

            if let Err(source) = written {
                let caller = Error::Connection {
                    server: self.shared.server.to_string(),
                    source: io::Error::new(source.kind(), source.to_string()),
                };
                self.shared.fail(Error::Connection {
                    server: self.shared.server.to_string(),
                    source,
                });
                return Err(caller);
            }
            receiver
        };
        self.shared.touch();
        trace!(server = %self.shared.server, conn = self.shared.id, kind = command.kind().name(), "sent");

        let Some(receiver) = receiver else {
            return Ok(None);
        };
        match receiver.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(Error::ConnectionClosed {
                server: self.shared.server.to_string(),
            }),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Poisons the connection if a write is abandoned halfway, since the server
/// would read the rest of the stream out of frame.
struct WriteGuard<'a> {
    shared: &'a Shared,
    done: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.close();
        }
    }
}

async fn open(server: &str) -> io::Result<Box<dyn Stream>> {
    #[cfg(unix)]
    if server.starts_with('/') {
        let stream = tokio::net::UnixStream::connect(server).await?;
        return Ok(Box::new(stream));
    }

    let stream = tokio::net::TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

async fn read_loop(mut reader: ReadHalf<Box<dyn Stream>>, shared: Arc<Shared>) {
    let _exit = CloseOnExit(Arc::clone(&shared));
    let mut parser = ResponseParser::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = shared.shutdown.notified() => break,
            read = tokio::time::timeout(shared.timeout, reader.read(&mut chunk)) => read,
        };

        let n = match read {
            Ok(Ok(0)) => {
                if shared.pending().is_empty() {
                    shared.close();
                } else {
                    shared.fail(Error::Connection {
                        server: shared.server.to_string(),
                        source: io::Error::new(io::ErrorKind::UnexpectedEof, "closed by server"),
                    });
                }
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(source)) => {
                shared.fail(Error::Connection {
                    server: shared.server.to_string(),
                    source,
                });
                break;
            }
            Err(_elapsed) => {
                let stalled = shared
                    .pending()
                    .front()
                    .is_some_and(|p| p.issued_at.elapsed() >= shared.timeout);
                if stalled {
                    shared.fail(Error::Timeout {
                        server: shared.server.to_string(),
                        after: shared.timeout,
                    });
                    break;
                }
                continue;
            }
        };

        let mut broken = None;
        for reply in parser.feed(&chunk[..n]) {
            if let Err(source) = &reply
                && source.is_fatal()
            {
                broken = Some(source.to_string());
            }
            let Some(pending) = shared.pending().pop_front() else {
                warn!(server = %shared.server, conn = shared.id, "reply with no pending command");
                continue;
            };
            let result = reply.map_err(|source| {
                if source.is_server_error() {
                    shared.reporter.server_error(&shared.server, &source.to_string());
                }
                Error::Protocol {
                    server: shared.server.to_string(),
                    key: None,
                    source,
                }
            });
            let _ = pending.slot.send(result);
        }

        if let Some(reason) = broken {
            shared.fail(Error::Connection {
                server: shared.server.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, reason),
            });
            break;
        }
    }

    trace!(server = %shared.server, conn = shared.id, "reader stopped");
}

/// Closes the connection however the reader task exits, so no caller is
/// left waiting on a slot nobody will resolve.
struct CloseOnExit(Arc<Shared>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol_memcache::{KeyPolicy, Request, Status};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    #[derive(Default)]
    struct Counting {
        failures: AtomicUsize,
        server_errors: AtomicUsize,
    }

    impl Reporter for Counting {
        fn connection_failed(&self, _server: &str, _message: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn server_error(&self, _server: &str, _message: &str) {
            self.server_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair(timeout: Duration) -> (Arc<Connection>, DuplexStream, Arc<Counting>) {
        let (client, server) = tokio::io::duplex(4096);
        let reporter = Arc::new(Counting::default());
        let conn = Connection::from_stream(
            1,
            Arc::from("test:11211"),
            Box::new(client),
            timeout,
            reporter.clone(),
        );
        (conn, server, reporter)
    }

    fn delete(key: &str) -> Command {
        Command::build(Request::delete(key), &KeyPolicy::default()).unwrap()
    }

    async fn read_lines(server: &mut DuplexStream, n: usize) -> Vec<String> {
        let mut reader = BufReader::new(server);
        let mut lines = Vec::new();
        for _ in 0..n {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn replies_resolve_in_issue_order() {
        let (conn, mut server, _) = pair(Duration::from_secs(5));
        let (a, b, c) = (delete("a"), delete("b"), delete("c"));

        let server_side = async {
            let lines = read_lines(&mut server, 3).await;
            assert_eq!(lines, ["delete a\r\n", "delete b\r\n", "delete c\r\n"]);
            // all three replies in one chunk
            server
                .write_all(b"DELETED\r\nNOT_FOUND\r\nDELETED\r\n")
                .await
                .unwrap();
        };

        let (ra, rb, rc, ()) = tokio::join!(conn.call(&a), conn.call(&b), conn.call(&c), server_side);
        assert_eq!(ra.unwrap(), Some(Frame::Status(Status::Deleted)));
        assert_eq!(rb.unwrap(), Some(Frame::Status(Status::NotFound)));
        assert_eq!(rc.unwrap(), Some(Frame::Status(Status::Deleted)));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn replies_split_across_chunks() {
        let (conn, mut server, _) = pair(Duration::from_secs(5));
        let get = Command::build(Request::Get { key: "k" }, &KeyPolicy::default()).unwrap();

        let server_side = async {
            read_lines(&mut server, 1).await;
            for piece in [&b"VALUE k 0 5\r"[..], b"\nhel", b"lo\r\nE", b"ND\r\n"] {
                server.write_all(piece).await.unwrap();
                server.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        };

        let (reply, ()) = tokio::join!(conn.call(&get), server_side);
        match reply.unwrap() {
            Some(Frame::Batch(entries)) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_reported_without_closing() {
        let (conn, mut server, reporter) = pair(Duration::from_secs(5));
        let cmd = delete("k");

        let server_side = async {
            read_lines(&mut server, 1).await;
            server.write_all(b"SERVER_ERROR out of memory\r\n").await.unwrap();
        };
        let (reply, ()) = tokio::join!(conn.call(&cmd), server_side);

        let err = reply.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(reporter.server_errors.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn eof_fails_pending_and_reports_once() {
        let (conn, mut server, reporter) = pair(Duration::from_secs(5));
        let (a, b) = (delete("a"), delete("b"));

        let server_side = async move {
            read_lines(&mut server, 2).await;
            drop(server);
        };
        let (ra, rb, ()) = tokio::join!(conn.call(&a), conn.call(&b), server_side);

        assert!(ra.unwrap_err().is_connection_error());
        assert!(rb.unwrap_err().is_connection_error());
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn broken_payload_framing_closes_connection() {
        let (conn, mut server, reporter) = pair(Duration::from_secs(5));
        let get = Command::build(Request::Get { key: "k" }, &KeyPolicy::default()).unwrap();
        let after = delete("k");

        let server_side = async {
            read_lines(&mut server, 2).await;
            server
                .write_all(b"VALUE k 0 18446744073709551615\r\nab\r\nEND\r\nDELETED\r\n")
                .await
                .unwrap();
        };
        let (first, second, ()) = tokio::join!(conn.call(&get), conn.call(&after), server_side);

        let first = first.unwrap_err();
        assert!(matches!(first, Error::Protocol { ref source, .. } if source.is_fatal()));
        assert!(second.unwrap_err().is_connection_error());
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(!conn.try_claim());
    }

    #[tokio::test]
    async fn write_failure_keeps_io_error() {
        let (conn, server, reporter) = pair(Duration::from_secs(5));
        drop(server);

        let err = conn.call(&delete("k")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection { ref source, .. } if source.kind() == io::ErrorKind::BrokenPipe
        ));
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (conn, mut server, reporter) = pair(Duration::from_millis(50));
        let cmd = delete("k");

        let server_side = async {
            read_lines(&mut server, 1).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        };
        let (reply, ()) = tokio::join!(conn.call(&cmd), server_side);

        assert!(matches!(reply.unwrap_err(), Error::Timeout { .. }));
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noreply_returns_after_write() {
        let (conn, mut server, _) = pair(Duration::from_secs(5));
        let cmd = Command::build(
            Request::Delete {
                key: "k",
                noreply: true,
            },
            &KeyPolicy::default(),
        )
        .unwrap();

        assert_eq!(conn.call(&cmd).await.unwrap(), None);
        assert_eq!(conn.in_flight(), 0);
        assert_eq!(read_lines(&mut server, 1).await, ["delete k noreply\r\n"]);
    }

    #[tokio::test]
    async fn close_fails_pending() {
        let (conn, _server, reporter) = pair(Duration::from_secs(5));
        let cmd = delete("k");

        let closer = async {
            while conn.in_flight() == 0 {
                tokio::task::yield_now().await;
            }
            conn.close();
        };
        let (reply, ()) = tokio::join!(conn.call(&cmd), closer);

        assert!(matches!(reply.unwrap_err(), Error::ConnectionClosed { .. }));
        assert_eq!(reporter.failures.load(Ordering::SeqCst), 0);
        assert!(!conn.try_claim());
    }
}
