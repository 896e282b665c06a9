//! Client-side request encoding for the Memcache ASCII protocol.
//!
//! Storage payloads are written as given; callers pass already-escaped bytes
//! (see [`Value::encode`](crate::Value::encode)) so that the declared byte
//! count matches what is on the wire.

/// Storage verbs sharing the `<verb> <key> <flags> <exptime> <bytes>` format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StorageVerb {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            StorageVerb::Set => b"set",
            StorageVerb::Add => b"add",
            StorageVerb::Replace => b"replace",
            StorageVerb::Append => b"append",
            StorageVerb::Prepend => b"prepend",
        }
    }
}

/// Argument to the `stats` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsGroup {
    General,
    Settings,
    Slabs,
    Items,
}

/// A request builder for encoding Memcache commands.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    /// GET command: `get <key>\r\n`
    Get { key: &'a str },
    /// Multi-GET command: `get <key1> <key2> ...\r\n`
    GetMulti { keys: &'a [&'a str] },
    /// GETS command (values with CAS tokens): `gets <key1> ...\r\n`
    Gets { keys: &'a [&'a str] },
    /// Storage command: `<verb> <key> <flags> <exptime> <bytes>[ noreply]\r\n<data>\r\n`
    Store {
        verb: StorageVerb,
        key: &'a str,
        value: &'a [u8],
        flags: u32,
        exptime: u32,
        noreply: bool,
    },
    /// CAS command: `cas <key> <flags> <exptime> <bytes> <cas_unique>[ noreply]\r\n<data>\r\n`
    Cas {
        key: &'a str,
        value: &'a [u8],
        flags: u32,
        exptime: u32,
        cas_unique: u64,
        noreply: bool,
    },
    /// INCR command: `incr <key> <delta>[ noreply]\r\n`
    Incr { key: &'a str, delta: u64, noreply: bool },
    /// DECR command: `decr <key> <delta>[ noreply]\r\n`
    Decr { key: &'a str, delta: u64, noreply: bool },
    /// DELETE command: `delete <key>[ noreply]\r\n`
    Delete { key: &'a str, noreply: bool },
    /// TOUCH command: `touch <key> <exptime>[ noreply]\r\n`
    Touch { key: &'a str, exptime: u32, noreply: bool },
    /// STATS command: `stats[ settings|slabs|items]\r\n`
    Stats(StatsGroup),
    /// `stats cachedump <slab> <limit>\r\n`
    Cachedump { slab: u32, limit: u32 },
    /// FLUSH_ALL command: `flush_all\r\n`
    FlushAll,
    /// VERSION command: `version\r\n`
    Version,
    /// Auto-discovery: `config get cluster\r\n`
    ConfigGet,
}

impl<'a> Request<'a> {
    /// Create a SET request with no flags, expiry or `noreply`.
    #[inline]
    pub fn set(key: &'a str, value: &'a [u8]) -> Self {
        Request::Store {
            verb: StorageVerb::Set,
            key,
            value,
            flags: 0,
            exptime: 0,
            noreply: false,
        }
    }

    /// Create a DELETE request.
    #[inline]
    pub fn delete(key: &'a str) -> Self {
        Request::Delete {
            key,
            noreply: false,
        }
    }

    /// Keys named by this request, in wire order.
    pub fn keys(&self) -> Vec<&'a str> {
        match self {
            Request::Get { key }
            | Request::Store { key, .. }
            | Request::Cas { key, .. }
            | Request::Incr { key, .. }
            | Request::Decr { key, .. }
            | Request::Delete { key, .. }
            | Request::Touch { key, .. } => vec![*key],
            Request::GetMulti { keys } | Request::Gets { keys } => keys.to_vec(),
            Request::Stats(_)
            | Request::Cachedump { .. }
            | Request::FlushAll
            | Request::Version
            | Request::ConfigGet => Vec::new(),
        }
    }

    /// Payload carried by storage requests.
    pub fn payload(&self) -> Option<&'a [u8]> {
        match self {
            Request::Store { value, .. } | Request::Cas { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Expiration time, for requests that set one.
    pub fn exptime(&self) -> Option<u32> {
        match self {
            Request::Store { exptime, .. }
            | Request::Cas { exptime, .. }
            | Request::Touch { exptime, .. } => Some(*exptime),
            _ => None,
        }
    }

    /// True when the server is told not to reply.
    pub fn noreply(&self) -> bool {
        match self {
            Request::Store { noreply, .. }
            | Request::Cas { noreply, .. }
            | Request::Incr { noreply, .. }
            | Request::Decr { noreply, .. }
            | Request::Delete { noreply, .. }
            | Request::Touch { noreply, .. } => *noreply,
            _ => false,
        }
    }

    /// Encode this request, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Request::Get { key } => encode_retrieval(buf, b"get", &[*key]),
            Request::GetMulti { keys } => encode_retrieval(buf, b"get", keys),
            Request::Gets { keys } => encode_retrieval(buf, b"gets", keys),
            Request::Store {
                verb,
                key,
                value,
                flags,
                exptime,
                noreply,
            } => encode_storage(
                buf,
                verb.as_bytes(),
                key,
                value,
                *flags,
                *exptime,
                None,
                *noreply,
            ),
            Request::Cas {
                key,
                value,
                flags,
                exptime,
                cas_unique,
                noreply,
            } => encode_storage(
                buf,
                b"cas",
                key,
                value,
                *flags,
                *exptime,
                Some(*cas_unique),
                *noreply,
            ),
            Request::Incr {
                key,
                delta,
                noreply,
            } => encode_keyed(buf, b"incr", key, Some(*delta), *noreply),
            Request::Decr {
                key,
                delta,
                noreply,
            } => encode_keyed(buf, b"decr", key, Some(*delta), *noreply),
            Request::Delete { key, noreply } => encode_keyed(buf, b"delete", key, None, *noreply),
            Request::Touch {
                key,
                exptime,
                noreply,
            } => encode_keyed(buf, b"touch", key, Some(u64::from(*exptime)), *noreply),
            Request::Stats(group) => match group {
                StatsGroup::General => encode_simple(buf, b"stats"),
                StatsGroup::Settings => encode_simple(buf, b"stats settings"),
                StatsGroup::Slabs => encode_simple(buf, b"stats slabs"),
                StatsGroup::Items => encode_simple(buf, b"stats items"),
            },
            Request::Cachedump { slab, limit } => {
                buf.extend_from_slice(b"stats cachedump ");
                push_number(buf, u64::from(*slab));
                buf.push(b' ');
                push_number(buf, u64::from(*limit));
                buf.extend_from_slice(b"\r\n");
            }
            Request::FlushAll => encode_simple(buf, b"flush_all"),
            Request::Version => encode_simple(buf, b"version"),
            Request::ConfigGet => encode_simple(buf, b"config get cluster"),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.payload().map_or(0, <[u8]>::len));
        self.encode(&mut buf);
        buf
    }
}

/// `<cmd> <key1> <key2> ...\r\n`
fn encode_retrieval(buf: &mut Vec<u8>, cmd: &[u8], keys: &[&str]) {
    buf.extend_from_slice(cmd);
    for key in keys {
        buf.push(b' ');
        buf.extend_from_slice(key.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

/// `<cmd> <key> <flags> <exptime> <bytes>[ <cas>][ noreply]\r\n<data>\r\n`
#[allow(clippy::too_many_arguments)]
fn encode_storage(
    buf: &mut Vec<u8>,
    cmd: &[u8],
    key: &str,
    value: &[u8],
    flags: u32,
    exptime: u32,
    cas_unique: Option<u64>,
    noreply: bool,
) {
    buf.extend_from_slice(cmd);
    buf.push(b' ');
    buf.extend_from_slice(key.as_bytes());
    buf.push(b' ');
    push_number(buf, u64::from(flags));
    buf.push(b' ');
    push_number(buf, u64::from(exptime));
    buf.push(b' ');
    push_number(buf, value.len() as u64);
    if let Some(cas) = cas_unique {
        buf.push(b' ');
        push_number(buf, cas);
    }
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// `<cmd> <key>[ <arg>][ noreply]\r\n`
fn encode_keyed(buf: &mut Vec<u8>, cmd: &[u8], key: &str, arg: Option<u64>, noreply: bool) {
    buf.extend_from_slice(cmd);
    buf.push(b' ');
    buf.extend_from_slice(key.as_bytes());
    if let Some(arg) = arg {
        buf.push(b' ');
        push_number(buf, arg);
    }
    if noreply {
        buf.extend_from_slice(b" noreply");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Encode a command with no key.
fn encode_simple(buf: &mut Vec<u8>, cmd: &[u8]) {
    buf.extend_from_slice(cmd);
    buf.extend_from_slice(b"\r\n");
}

fn push_number(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(n.to_string().as_bytes());
}
