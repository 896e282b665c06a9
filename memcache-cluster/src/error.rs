use std::io;
use std::time::Duration;

use protocol_memcache::{ReplyError, ValidationError};

/// Errors returned by the cluster client.
///
/// Cache misses and `NOT_FOUND`/`NOT_STORED` replies are normal results, not
/// errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The call was rejected before any I/O.
    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),

    /// The server answered with `ERROR`, `CLIENT_ERROR`, `SERVER_ERROR` or
    /// something unrecognized.
    #[error("{server}: {source}")]
    Protocol {
        server: String,
        key: Option<String>,
        #[source]
        source: ReplyError,
    },

    /// Connecting, writing or reading failed.
    #[error("{server}: connection error: {source}")]
    Connection {
        server: String,
        #[source]
        source: io::Error,
    },

    /// No bytes arrived from the server within the configured timeout.
    #[error("{server}: timed out after {after:?}")]
    Timeout { server: String, after: Duration },

    /// The connection went away while the command was in flight.
    #[error("{server}: connection closed")]
    ConnectionClosed { server: String },

    /// The client-wide in-flight ceiling was reached.
    #[error("queue limit of {limit} in-flight commands reached")]
    QueueLimit { limit: usize },

    /// The target server is currently marked as failed.
    #[error("{server} is not available")]
    Unavailable { server: String },

    /// The ring is empty.
    #[error("no servers available")]
    NoServers,

    /// [`Client::end`](crate::Client::end) was called.
    #[error("client has been shut down")]
    Shutdown,
}

impl Error {
    /// The server the error relates to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Error::Protocol { server, .. }
            | Error::Connection { server, .. }
            | Error::Timeout { server, .. }
            | Error::ConnectionClosed { server }
            | Error::Unavailable { server } => Some(server),
            _ => None,
        }
    }

    /// The key of the command that triggered a protocol error.
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::Protocol { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    /// True for transport failures, which count against the server's health.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Timeout { .. } | Error::ConnectionClosed { .. }
        )
    }

    pub(crate) fn with_key(self, caller_key: &str) -> Self {
        match self {
            Error::Protocol { server, source, .. } => Error::Protocol {
                server,
                key: Some(caller_key.to_owned()),
                source,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_carries_context() {
        let err = Error::Protocol {
            server: "10.0.0.1:11211".into(),
            key: None,
            source: ReplyError::ClientError("bad data chunk".into()),
        }
        .with_key("user:1");

        assert_eq!(err.server(), Some("10.0.0.1:11211"));
        assert_eq!(err.key(), Some("user:1"));
        assert_eq!(err.to_string(), "10.0.0.1:11211: CLIENT_ERROR bad data chunk");
        assert!(!err.is_connection_error());
    }

    #[test]
    fn connection_errors_are_classified() {
        let err = Error::Connection {
            server: "a:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.is_connection_error());
        assert!(Error::Timeout {
            server: "a:1".into(),
            after: Duration::from_secs(1)
        }
        .is_connection_error());
        assert!(!Error::NoServers.is_connection_error());
        assert_eq!(Error::NoServers.server(), None);
    }
}
