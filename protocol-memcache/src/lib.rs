//! Client-side Memcache ASCII protocol.
//!
//! This crate has no I/O. It turns typed operations into wire commands and
//! turns an arbitrarily chunked byte stream from a server back into one
//! reply per issued command, in issue order.
//!
//! # Example
//!
//! ```
//! use protocol_memcache::{Command, CommandKind, KeyPolicy, Reply, Request, ResponseParser, Value};
//!
//! // Build a GET command
//! let cmd = Command::build(Request::Get { key: "mykey" }, &KeyPolicy::default()).unwrap();
//! assert_eq!(cmd.wire().as_ref(), b"get mykey\r\n");
//!
//! // Feed the response in two pieces
//! let mut parser = ResponseParser::new();
//! assert!(parser.feed(b"VALUE mykey 0 5\r\nhel").is_empty());
//! let mut frames = parser.feed(b"lo\r\nEND\r\n");
//! let reply = Reply::assemble(CommandKind::Get, frames.remove(0).unwrap()).unwrap();
//! match reply {
//!     Reply::Value(Some(item)) => assert_eq!(item.value, Value::from("hello")),
//!     _ => panic!("expected a hit"),
//! }
//! ```

mod command;
mod error;
mod reply;
mod request;
mod response;
mod value;

pub use command::{
    Command, CommandKind, DEFAULT_MAX_EXPIRATION, DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN,
    KeyPolicy, compress_key,
};
pub use error::{ParseError, ReplyError, ValidationError};
pub use reply::{GroupedStats, Reply, StatsMap};
pub use request::{Request, StatsGroup, StorageVerb};
pub use response::{
    CacheItem, ClusterConfig, ClusterNode, Entry, Frame, Item, ParseResult, ResponseParser,
    StatValue, Status, Version,
};
pub use value::{FLAG_BINARY, FLAG_JSON, FLAG_NUMERIC, Value, escape, unescape};
