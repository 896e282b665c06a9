//! In-process memcached stand-in for integration tests.
//!
//! Speaks enough of the text protocol for the client: storage verbs,
//! get/gets, delete, incr/decr, touch, stats, cachedump, flush_all and
//! version. Payloads are stored exactly as received.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An address nothing listens on.
pub async fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[derive(Debug, Clone)]
struct Item {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

#[derive(Debug, Default)]
struct State {
    items: BTreeMap<String, Item>,
    next_cas: u64,
}

impl State {
    fn put(&mut self, key: &str, flags: u32, data: Vec<u8>) {
        self.next_cas += 1;
        let cas = self.next_cas;
        self.items.insert(key.to_owned(), Item { flags, data, cas });
    }
}

pub struct FakeServer {
    pub addr: String,
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub async fn start() -> FakeServer {
        Self::start_on("127.0.0.1:0").await
    }

    pub async fn start_on(addr: &str) -> FakeServer {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(State::default()));
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });
        FakeServer { addr, state }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<String> = line
            .trim_end_matches("\r\n")
            .split(' ')
            .map(str::to_owned)
            .collect();
        let noreply = parts.last().is_some_and(|p| p == "noreply");

        let reply = match parts[0].as_str() {
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let len: usize = parts[4].parse().unwrap();
                let mut data = vec![0u8; len + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    return;
                }
                data.truncate(len);
                store(&mut state.lock().unwrap(), &parts, data)
            }
            "get" | "gets" => {
                let state = state.lock().unwrap();
                let mut out = Vec::new();
                for key in &parts[1..] {
                    if let Some(item) = state.items.get(key) {
                        let header = if parts[0] == "gets" {
                            format!("VALUE {key} {} {} {}\r\n", item.flags, item.data.len(), item.cas)
                        } else {
                            format!("VALUE {key} {} {}\r\n", item.flags, item.data.len())
                        };
                        out.extend_from_slice(header.as_bytes());
                        out.extend_from_slice(&item.data);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
                out
            }
            "delete" => match state.lock().unwrap().items.remove(&parts[1]) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            "incr" | "decr" => arithmetic(&mut state.lock().unwrap(), &parts),
            "touch" => match state.lock().unwrap().items.contains_key(&parts[1]) {
                true => b"TOUCHED\r\n".to_vec(),
                false => b"NOT_FOUND\r\n".to_vec(),
            },
            "flush_all" => {
                state.lock().unwrap().items.clear();
                b"OK\r\n".to_vec()
            }
            "version" => b"VERSION 1.6.21\r\n".to_vec(),
            "stats" => stats(&state.lock().unwrap(), &parts),
            _ => b"ERROR\r\n".to_vec(),
        };

        if !noreply && write.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn store(state: &mut State, parts: &[String], data: Vec<u8>) -> Vec<u8> {
    let key = &parts[1];
    let flags: u32 = parts[2].parse().unwrap();
    let existing = state.items.get(key).cloned();

    let reply: &[u8] = match (parts[0].as_str(), existing) {
        ("set", _) => {
            state.put(key, flags, data);
            b"STORED\r\n"
        }
        ("add", Some(_)) | ("replace" | "append" | "prepend", None) => b"NOT_STORED\r\n",
        ("add" | "replace", _) => {
            state.put(key, flags, data);
            b"STORED\r\n"
        }
        ("append", Some(item)) => {
            state.put(key, item.flags, [item.data, data].concat());
            b"STORED\r\n"
        }
        ("prepend", Some(item)) => {
            state.put(key, item.flags, [data, item.data].concat());
            b"STORED\r\n"
        }
        ("cas", None) => b"NOT_FOUND\r\n",
        ("cas", Some(item)) => {
            if parts[5].parse::<u64>().ok() == Some(item.cas) {
                state.put(key, flags, data);
                b"STORED\r\n"
            } else {
                b"EXISTS\r\n"
            }
        }
        _ => b"ERROR\r\n",
    };
    reply.to_vec()
}

fn arithmetic(state: &mut State, parts: &[String]) -> Vec<u8> {
    let Some(item) = state.items.get(&parts[1]).cloned() else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let delta: u64 = parts[2].parse().unwrap();
    let Some(current) = std::str::from_utf8(&item.data)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
    else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };
    let next = if parts[0] == "incr" {
        current.wrapping_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    state.put(&parts[1], item.flags, next.to_string().into_bytes());
    format!("{next}\r\n").into_bytes()
}

fn stats(state: &State, parts: &[String]) -> Vec<u8> {
    let mut out = String::new();
    match parts.get(1).map(String::as_str) {
        None => {
            out.push_str("STAT pid 1\r\n");
            out.push_str(&format!("STAT curr_items {}\r\n", state.items.len()));
            out.push_str("STAT rusage_user 0.5\r\n");
            out.push_str("STAT version 1.6.21\r\n");
        }
        Some("settings") => out.push_str("STAT maxconns 1024\r\nSTAT evictions on\r\n"),
        Some("slabs") => out.push_str("STAT 1:chunk_size 96\r\nSTAT 1:used_chunks 2\r\nSTAT active_slabs 1\r\n"),
        Some("items") => out.push_str(&format!("STAT items:1:number {}\r\n", state.items.len())),
        Some("cachedump") => {
            for (key, item) in &state.items {
                out.push_str(&format!("ITEM {key} [{} b; 0 s]\r\n", item.data.len()));
            }
        }
        Some(_) => return b"ERROR\r\n".to_vec(),
    }
    out.push_str("END\r\n");
    out.into_bytes()
}
