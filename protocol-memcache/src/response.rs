//! Incremental response parsing.
//!
//! Response types:
//! - `VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n... END\r\n` - GET/GETS response
//! - `STAT <name> <value>\r\n... END\r\n` - STATS response
//! - `ITEM <key> [<bytes> b; <exptime> s]\r\n... END\r\n` - cachedump response
//! - `CONFIG cluster 0 <bytes>\r\n<data>\r\nEND\r\n` - auto-discovery response
//! - `STORED`, `NOT_STORED`, `EXISTS`, `NOT_FOUND`, `DELETED`, `TOUCHED`, `OK`
//! - `<number>\r\n` - INCR/DECR response
//! - `VERSION <x.y.z>\r\n`
//! - `ERROR`, `CLIENT_ERROR <msg>`, `SERVER_ERROR <msg>`
//!
//! [`ResponseParser`] owns the bytes received on one connection. Each call to
//! [`ResponseParser::feed`] returns the replies completed by that chunk, one
//! per issued command and in issue order. A chunk is only scanned once the
//! buffered data ends in `\r\n`; anything else may stop mid-line.

use bytes::{Buf, BytesMut};

use crate::error::{ParseError, ReplyError};
use crate::value::Value;

const CRLF: &[u8] = b"\r\n";

/// A single value from a GET or GETS response.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: String,
    pub value: Value,
    pub flags: u32,
    /// CAS unique token, present when the response is from a `gets` command.
    pub cas: Option<u64>,
}

/// A `STAT` value, coerced to a number when it looks like one.
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl StatValue {
    fn parse(raw: &str) -> Self {
        if let Ok(n) = raw.parse::<i64>() {
            return StatValue::Integer(n);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => StatValue::Float(f),
            _ => StatValue::Text(raw.to_owned()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StatValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatValue::Integer(n) => Some(*n as f64),
            StatValue::Float(f) => Some(*f),
            StatValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One line of a `stats cachedump` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    /// Item size in bytes.
    pub size: u64,
    /// Expiration as a unix timestamp.
    pub expires: u64,
}

/// Server version as reported by `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
    pub raw: String,
}

impl Version {
    /// Components that are missing or not numeric read as zero.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        });
        Version {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            bugfix: parts.next().unwrap_or(0),
            raw: raw.to_owned(),
        }
    }
}

/// A node listed in a cluster auto-discovery response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub host: String,
    pub ip: String,
    pub port: u16,
}

impl ClusterNode {
    /// `host:port` form used for ring identities.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster auto-discovery payload: a config version and the node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub version: u64,
    pub nodes: Vec<ClusterNode>,
}

impl ClusterConfig {
    /// Parse `<version>\n<host>|<ip>|<port> <host>|<ip>|<port> ...\n`.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let text = String::from_utf8_lossy(payload);
        let mut lines = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty());

        let version = lines
            .next()
            .ok_or(ParseError::Protocol("missing config version"))?
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidNumber)?;

        let mut nodes = Vec::new();
        if let Some(list) = lines.next() {
            for entry in list.split(' ').filter(|e| !e.is_empty()) {
                let mut fields = entry.split('|');
                let (Some(host), Some(ip), Some(port)) = (fields.next(), fields.next(), fields.next())
                else {
                    return Err(ParseError::Protocol("invalid cluster node"));
                };
                nodes.push(ClusterNode {
                    host: host.to_owned(),
                    ip: ip.to_owned(),
                    port: port.parse().map_err(|_| ParseError::InvalidNumber)?,
                });
            }
        }

        Ok(ClusterConfig { version, nodes })
    }
}

/// Single-line status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
}

impl Status {
    /// `NOT_STORED`, `EXISTS` and `NOT_FOUND` are negative but not errors.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Stored | Status::Deleted | Status::Touched | Status::Ok
        )
    }
}

/// A line (or line plus payload) buffered until the batch terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Value(Item),
    Stat(String, StatValue),
    Item(CacheItem),
    Config(ClusterConfig),
}

/// A complete reply to one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(Status),
    Numeric(u64),
    Version(Version),
    /// Everything buffered before `END`, in arrival order. Empty on a miss.
    Batch(Vec<Entry>),
}

/// Outcome of consuming one token.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// Resolve the oldest pending command now.
    Continue(Result<Frame, ReplyError>),
    /// The token was buffered; wait for more.
    Buffer,
    /// The batch is over; resolve the oldest pending command with it.
    Flush(Result<Frame, ReplyError>),
}

/// Stateful parser for one connection's inbound byte stream.
#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: BytesMut,
    queue: Vec<Entry>,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every reply it completes, oldest first.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Frame, ReplyError>> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        if !self.buffer.ends_with(CRLF) {
            return out;
        }

        let mut pos = 0;
        while pos < self.buffer.len() {
            let Some((result, consumed)) = step(&self.buffer[pos..], &mut self.queue) else {
                break;
            };
            pos += consumed;
            match result {
                ParseResult::Continue(reply) | ParseResult::Flush(reply) => out.push(reply),
                ParseResult::Buffer => {}
            }
        }
        self.buffer.advance(pos);
        out
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Entries waiting for their `END`.
    pub fn pending_entries(&self) -> usize {
        self.queue.len()
    }

    /// Drop all partial state, e.g. after the connection failed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.queue.clear();
    }
}

enum Token<'a> {
    Status(Status),
    End,
    Error,
    ClientError(&'a [u8]),
    ServerError(&'a [u8]),
    Value(&'a [u8]),
    Config(&'a [u8]),
    Stat(&'a [u8]),
    Item(&'a [u8]),
    Version(&'a [u8]),
    Numeric(&'a [u8]),
    Unknown,
}

fn classify(line: &[u8]) -> Token<'_> {
    match line {
        b"STORED" => return Token::Status(Status::Stored),
        b"NOT_STORED" => return Token::Status(Status::NotStored),
        b"EXISTS" => return Token::Status(Status::Exists),
        b"NOT_FOUND" => return Token::Status(Status::NotFound),
        b"DELETED" => return Token::Status(Status::Deleted),
        b"TOUCHED" => return Token::Status(Status::Touched),
        b"OK" => return Token::Status(Status::Ok),
        b"END" => return Token::End,
        b"ERROR" => return Token::Error,
        _ => {}
    }

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        Token::Value(rest)
    } else if let Some(rest) = line.strip_prefix(b"STAT ") {
        Token::Stat(rest)
    } else if let Some(rest) = line.strip_prefix(b"ITEM ") {
        Token::Item(rest)
    } else if let Some(rest) = line.strip_prefix(b"VERSION ") {
        Token::Version(rest)
    } else if let Some(rest) = line.strip_prefix(b"CONFIG ") {
        Token::Config(rest)
    } else if let Some(rest) = line.strip_prefix(b"CLIENT_ERROR") {
        Token::ClientError(rest.trim_ascii_start())
    } else if let Some(rest) = line.strip_prefix(b"SERVER_ERROR") {
        Token::ServerError(rest.trim_ascii_start())
    } else {
        // decr may space-pad its result
        let digits = line.trim_ascii_end();
        if !digits.is_empty() && digits.iter().all(u8::is_ascii_digit) {
            Token::Numeric(digits)
        } else {
            Token::Unknown
        }
    }
}

/// Consume one token from the front of `data`.
///
/// Returns `None` when the token is not complete yet.
fn step(data: &[u8], queue: &mut Vec<Entry>) -> Option<(ParseResult, usize)> {
    let line_end = memchr::memmem::find(data, CRLF)?;
    let line = &data[..line_end];
    let consumed = line_end + 2;

    let result = match classify(line) {
        Token::Status(status) => ParseResult::Continue(Ok(Frame::Status(status))),
        Token::Numeric(digits) => {
            ParseResult::Continue(parse_u64(digits).map(Frame::Numeric).map_err(Into::into))
        }
        Token::Version(raw) => {
            ParseResult::Continue(Ok(Frame::Version(Version::parse(&lossy(raw)))))
        }
        Token::Error => {
            queue.clear();
            ParseResult::Flush(Err(ReplyError::Error))
        }
        Token::ClientError(msg) => ParseResult::Continue(Err(ReplyError::ClientError(lossy(msg)))),
        Token::ServerError(msg) => ParseResult::Continue(Err(ReplyError::ServerError(lossy(msg)))),
        Token::Stat(rest) => {
            let text = lossy(rest);
            let (name, value) = text.split_once(' ').unwrap_or((text.as_str(), ""));
            queue.push(Entry::Stat(name.to_owned(), StatValue::parse(value)));
            ParseResult::Buffer
        }
        Token::Item(rest) => match parse_cache_item(rest) {
            Ok(item) => {
                queue.push(Entry::Item(item));
                ParseResult::Buffer
            }
            Err(e) => ParseResult::Continue(Err(e.into())),
        },
        Token::Value(header) => return payload_step(header, data, consumed, queue, false),
        Token::Config(header) => return payload_step(header, data, consumed, queue, true),
        Token::End => ParseResult::Flush(Ok(Frame::Batch(std::mem::take(queue)))),
        Token::Unknown => ParseResult::Continue(Err(ReplyError::Unknown(lossy(line)))),
    };

    Some((result, consumed))
}

/// Handle a header that announces `<bytes>` of payload on the following line.
///
/// The declared length is authoritative: payload bytes are never scanned for
/// keywords, so a value containing `END\r\n` cannot end the batch early.
fn payload_step(
    header: &[u8],
    data: &[u8],
    header_len: usize,
    queue: &mut Vec<Entry>,
    config: bool,
) -> Option<(ParseResult, usize)> {
    let parsed = match parse_value_header(header) {
        Ok(parsed) => parsed,
        Err(e @ ParseError::OutOfFrame(_)) => return Some(out_of_frame(e, data, queue)),
        Err(e) => return Some((ParseResult::Continue(Err(e.into())), header_len)),
    };

    let Some(body_end) = header_len.checked_add(parsed.bytes) else {
        return Some(out_of_frame(ParseError::OutOfFrame("value length overflow"), data, queue));
    };
    let Some(frame_end) = body_end.checked_add(2) else {
        return Some(out_of_frame(ParseError::OutOfFrame("value length overflow"), data, queue));
    };
    if data.len() < frame_end {
        return None;
    }
    if &data[body_end..frame_end] != CRLF {
        return Some(out_of_frame(ParseError::OutOfFrame("missing data terminator"), data, queue));
    }

    let payload = &data[header_len..body_end];
    let entry = if config {
        match ClusterConfig::parse(payload) {
            Ok(config) => Entry::Config(config),
            Err(e) => return Some((ParseResult::Continue(Err(e.into())), body_end + 2)),
        }
    } else {
        Entry::Value(Item {
            key: parsed.key,
            value: Value::decode(parsed.flags, payload),
            flags: parsed.flags,
            cas: parsed.cas,
        })
    };
    queue.push(entry);

    Some((ParseResult::Buffer, body_end + 2))
}

/// Fail the current command and discard everything buffered, since the rest
/// of the stream can no longer be split into replies.
fn out_of_frame(err: ParseError, data: &[u8], queue: &mut Vec<Entry>) -> (ParseResult, usize) {
    queue.clear();
    (ParseResult::Flush(Err(err.into())), data.len())
}

struct ValueHeader {
    key: String,
    flags: u32,
    bytes: usize,
    cas: Option<u64>,
}

/// Parse `<key> <flags> <bytes> [<cas unique>]`.
fn parse_value_header(header: &[u8]) -> Result<ValueHeader, ParseError> {
    let parts: Vec<&[u8]> = header
        .split(|&b| b == b' ')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 3 {
        return Err(ParseError::Protocol("invalid VALUE line"));
    }

    Ok(ValueHeader {
        key: lossy(parts[0]),
        flags: parse_u32(parts[1])?,
        bytes: usize::try_from(parse_u64(parts[2])?)
            .map_err(|_| ParseError::OutOfFrame("value length overflow"))?,
        cas: match parts.get(3) {
            Some(cas) => Some(parse_u64(cas)?),
            None => None,
        },
    })
}

/// Parse `<key> [<bytes> b; <exptime> s]`.
fn parse_cache_item(rest: &[u8]) -> Result<CacheItem, ParseError> {
    let text = lossy(rest);
    let (key, meta) = text
        .split_once(' ')
        .ok_or(ParseError::Protocol("invalid ITEM line"))?;

    let mut item = CacheItem {
        key: key.to_owned(),
        size: 0,
        expires: 0,
    };
    let meta = meta.trim().trim_start_matches('[').trim_end_matches(']');
    for part in meta.split(';').map(str::trim) {
        if let Some(n) = part.strip_suffix(" b") {
            item.size = n.trim().parse().map_err(|_| ParseError::InvalidNumber)?;
        } else if let Some(n) = part.strip_suffix(" s") {
            item.expires = n.trim().parse().map_err(|_| ParseError::InvalidNumber)?;
        }
    }
    Ok(item)
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Parse a u32 from ASCII decimal.
fn parse_u32(data: &[u8]) -> Result<u32, ParseError> {
    std::str::from_utf8(data)
        .map_err(|_| ParseError::InvalidNumber)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}

/// Parse a u64 from ASCII decimal.
fn parse_u64(data: &[u8]) -> Result<u64, ParseError> {
    std::str::from_utf8(data)
        .map_err(|_| ParseError::InvalidNumber)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}
