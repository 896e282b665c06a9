//! Typed cache values and their wire encoding.
//!
//! The item flags word records how a value was encoded so a reader gets the
//! same type back:
//!
//! | flags          | payload                      |
//! |----------------|------------------------------|
//! | `0`            | UTF-8 text (raw bytes if not UTF-8) |
//! | `FLAG_JSON`    | JSON document                |
//! | `FLAG_BINARY`  | opaque bytes                 |
//! | `FLAG_NUMERIC` | decimal number               |
//!
//! Payloads are escaped before transmission: every `\r` or `\n` byte gets a
//! backslash in front of it, and the reader strips exactly one backslash
//! before each `\r` or `\n`.

use bytes::Bytes;

/// Value was serialized as JSON.
pub const FLAG_JSON: u32 = 1 << 1;
/// Value is opaque binary data.
pub const FLAG_BINARY: u32 = 1 << 2;
/// Value is a number in decimal text form.
pub const FLAG_NUMERIC: u32 = 1 << 3;

/// A value stored in or read from the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(serde_json::Number),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Value {
    /// The flags word written alongside this value.
    pub fn flags(&self) -> u32 {
        match self {
            Value::Text(_) => 0,
            Value::Number(_) => FLAG_NUMERIC,
            Value::Json(_) => FLAG_JSON,
            Value::Binary(_) => FLAG_BINARY,
        }
    }

    /// Escaped payload bytes, ready to be framed by a storage command.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Text(s) => escape(s.as_bytes()),
            Value::Number(n) => escape(n.to_string().as_bytes()),
            Value::Json(v) => escape(v.to_string().as_bytes()),
            Value::Binary(b) => escape(b),
        }
    }

    /// Rebuild a value from its flags and escaped payload.
    ///
    /// A payload that does not parse as its flagged type falls back to text
    /// (or raw bytes when it is not UTF-8) rather than failing the read.
    pub fn decode(flags: u32, escaped: &[u8]) -> Value {
        let raw = unescape(escaped);
        match flags {
            FLAG_BINARY => Value::Binary(Bytes::from(raw)),
            FLAG_JSON => match serde_json::from_slice(&raw) {
                Ok(json) => Value::Json(json),
                Err(_) => text_or_binary(raw),
            },
            FLAG_NUMERIC => {
                let parsed = std::str::from_utf8(&raw)
                    .ok()
                    .and_then(|s| s.trim().parse::<serde_json::Number>().ok());
                match parsed {
                    Some(n) => Value::Number(n),
                    None => text_or_binary(raw),
                }
            }
            _ => text_or_binary(raw),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

fn text_or_binary(raw: Vec<u8>) -> Value {
    match String::from_utf8(raw) {
        Ok(s) => Value::Text(s),
        Err(e) => Value::Binary(Bytes::from(e.into_bytes())),
    }
}

/// Insert a backslash before every `\r` and `\n` byte.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let extra = memchr::memchr2_iter(b'\r', b'\n', data).count();
    let mut out = Vec::with_capacity(data.len() + extra);
    for &b in data {
        if b == b'\r' || b == b'\n' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

/// Remove one backslash in front of every `\r` and `\n` byte.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\' && i + 1 < data.len() && matches!(data[i + 1], b'\r' | b'\n') {
            i += 1;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

/// Non-finite floats have no number form and are stored as JSON `null`.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        match serde_json::Number::from_f64(n) {
            Some(n) => Value::Number(n),
            None => Value::Json(serde_json::Value::Null),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Binary(Bytes::copy_from_slice(b))
    }
}
