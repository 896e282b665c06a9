//! Command construction: validation, key compression and serialization.
//!
//! A [`Command`] is built once per call from a [`Request`] and never changes
//! afterwards. Keys longer than the configured maximum are either rejected or
//! replaced by their MD5 hex digest; the replacement is applied to the
//! already-encoded header line so the payload is never re-serialized.

use std::time::Instant;

use bytes::Bytes;

use crate::error::ValidationError;
use crate::request::{Request, StatsGroup};

/// Default maximum key size in bytes (memcached default is 250)
pub const DEFAULT_MAX_KEY_LEN: usize = 250;

/// Default maximum value size in bytes (memcached default is 1MB)
pub const DEFAULT_MAX_VALUE_LEN: usize = 1024 * 1024;

/// Default maximum relative expiration in seconds (30 days). Larger values
/// would be read by the server as absolute unix timestamps.
pub const DEFAULT_MAX_EXPIRATION: u32 = 2_592_000;

/// Limits applied to every command before it is serialized.
#[derive(Debug, Clone, Copy)]
pub struct KeyPolicy {
    /// Maximum key size in bytes.
    pub max_key_len: usize,
    /// Maximum encoded value size in bytes.
    pub max_value_len: usize,
    /// Maximum expiration in seconds.
    pub max_expiration: u32,
    /// Hash oversized keys instead of rejecting them.
    pub compress_keys: bool,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyPolicy {
    pub const fn new() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            max_expiration: DEFAULT_MAX_EXPIRATION,
            compress_keys: true,
        }
    }

    /// Set the maximum key length.
    pub const fn max_key_len(mut self, len: usize) -> Self {
        self.max_key_len = len;
        self
    }

    /// Set the maximum value length.
    pub const fn max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len;
        self
    }

    /// Set the maximum expiration.
    pub const fn max_expiration(mut self, secs: u32) -> Self {
        self.max_expiration = secs;
        self
    }

    /// Enable or disable hashing of oversized keys.
    pub const fn compress_keys(mut self, enabled: bool) -> Self {
        self.compress_keys = enabled;
        self
    }
}

/// What kind of reply a command expects. Drives reply assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Get,
    GetMulti,
    Gets,
    Store,
    Cas,
    Delete,
    Touch,
    Arithmetic,
    Stats(StatsGroup),
    Cachedump,
    FlushAll,
    Version,
    Config,
}

impl CommandKind {
    pub fn of(request: &Request<'_>) -> Self {
        match request {
            Request::Get { .. } => CommandKind::Get,
            Request::GetMulti { .. } => CommandKind::GetMulti,
            Request::Gets { .. } => CommandKind::Gets,
            Request::Store { .. } => CommandKind::Store,
            Request::Cas { .. } => CommandKind::Cas,
            Request::Incr { .. } | Request::Decr { .. } => CommandKind::Arithmetic,
            Request::Delete { .. } => CommandKind::Delete,
            Request::Touch { .. } => CommandKind::Touch,
            Request::Stats(group) => CommandKind::Stats(*group),
            Request::Cachedump { .. } => CommandKind::Cachedump,
            Request::FlushAll => CommandKind::FlushAll,
            Request::Version => CommandKind::Version,
            Request::ConfigGet => CommandKind::Config,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Get => "get",
            CommandKind::GetMulti => "get (multi)",
            CommandKind::Gets => "gets",
            CommandKind::Store => "store",
            CommandKind::Cas => "cas",
            CommandKind::Delete => "delete",
            CommandKind::Touch => "touch",
            CommandKind::Arithmetic => "incr/decr",
            CommandKind::Stats(StatsGroup::General) => "stats",
            CommandKind::Stats(StatsGroup::Settings) => "stats settings",
            CommandKind::Stats(StatsGroup::Slabs) => "stats slabs",
            CommandKind::Stats(StatsGroup::Items) => "stats items",
            CommandKind::Cachedump => "stats cachedump",
            CommandKind::FlushAll => "flush_all",
            CommandKind::Version => "version",
            CommandKind::Config => "config get",
        }
    }
}

/// A validated, serialized command.
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    /// Keys as written on the wire.
    keys: Vec<String>,
    /// (wire key, caller key) for every key that was compressed.
    renamed: Vec<(String, String)>,
    flags: u32,
    expiry: Option<u32>,
    cas: Option<u64>,
    noreply: bool,
    wire: Bytes,
    issued_at: Instant,
}

impl Command {
    /// Validate and serialize a request.
    pub fn build(request: Request<'_>, policy: &KeyPolicy) -> Result<Self, ValidationError> {
        validate(&request, policy)?;

        let mut wire = request.to_vec();
        let mut keys = Vec::new();
        let mut renamed = Vec::new();
        for key in request.keys() {
            if key.len() > policy.max_key_len {
                let hashed = compress_key(key);
                patch_key(&mut wire, key, &hashed);
                renamed.push((hashed.clone(), key.to_owned()));
                keys.push(hashed);
            } else {
                keys.push(key.to_owned());
            }
        }

        let (flags, cas) = match &request {
            Request::Store { flags, .. } => (*flags, None),
            Request::Cas {
                flags, cas_unique, ..
            } => (*flags, Some(*cas_unique)),
            _ => (0, None),
        };

        Ok(Command {
            kind: CommandKind::of(&request),
            keys,
            renamed,
            flags,
            expiry: request.exptime(),
            cas,
            noreply: request.noreply(),
            wire: Bytes::from(wire),
            issued_at: Instant::now(),
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The first key on the wire, used for routing.
    pub fn key(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Map a key as seen on the wire back to the key the caller passed.
    pub fn caller_key<'a>(&'a self, wire_key: &'a str) -> &'a str {
        self.renamed
            .iter()
            .find(|(hashed, _)| hashed == wire_key)
            .map_or(wire_key, |(_, original)| original.as_str())
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn expiry(&self) -> Option<u32> {
        self.expiry
    }

    pub fn cas(&self) -> Option<u64> {
        self.cas
    }

    /// True when no reply will arrive for this command.
    pub fn noreply(&self) -> bool {
        self.noreply
    }

    /// The exact bytes to write.
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }
}

/// Hash a key to a fixed-length hex digest.
pub fn compress_key(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

fn validate(request: &Request<'_>, policy: &KeyPolicy) -> Result<(), ValidationError> {
    let keys = request.keys();
    if keys.is_empty() && matches!(request, Request::GetMulti { .. } | Request::Gets { .. }) {
        return Err(ValidationError::NoKeys);
    }

    for key in keys {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(ValidationError::InvalidKey {
                key: key.to_owned(),
            });
        }
        if key.len() > policy.max_key_len && !policy.compress_keys {
            return Err(ValidationError::KeyTooLong {
                len: key.len(),
                max: policy.max_key_len,
            });
        }
    }

    if let Some(payload) = request.payload()
        && payload.len() > policy.max_value_len
    {
        return Err(ValidationError::ValueTooLarge {
            len: payload.len(),
            max: policy.max_value_len,
        });
    }

    if let Some(exptime) = request.exptime()
        && exptime > policy.max_expiration
    {
        return Err(ValidationError::ExpirationTooLarge {
            exptime,
            max: policy.max_expiration,
        });
    }

    Ok(())
}

/// Replace every occurrence of `key` among the header line's arguments.
fn patch_key(wire: &mut Vec<u8>, key: &str, replacement: &str) {
    let header_end = memchr::memmem::find(wire, b"\r\n").unwrap_or(wire.len());
    let mut patched = Vec::with_capacity(wire.len());
    for (i, token) in wire[..header_end].split(|&b| b == b' ').enumerate() {
        if i > 0 {
            patched.push(b' ');
        }
        if i > 0 && token == key.as_bytes() {
            patched.extend_from_slice(replacement.as_bytes());
        } else {
            patched.extend_from_slice(token);
        }
    }
    patched.extend_from_slice(&wire[header_end..]);
    *wire = patched;
}
