//! In-process mock memcached speaking the binary protocol.
//!
//! Parses request frames and encodes response frames by hand, so the tests
//! cross-check the client's framing rather than reusing it. Supports the
//! opcodes the client issues, CAS accounting, ASCII counters, SASL PLAIN,
//! and a "silent" mode that reads requests but never answers (for deadline
//! tests).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const HEADER: usize = 24;

#[derive(Clone, Debug)]
pub struct Entry {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Default)]
pub struct StoreInner {
    pub entries: HashMap<Vec<u8>, Entry>,
    pub flush_delays: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct MockOptions {
    /// Read requests, never respond.
    pub silent: bool,
    /// Require SASL PLAIN with these credentials before serving.
    pub credentials: Option<(String, String)>,
}

pub struct MockServer {
    pub addr: String,
    pub store: Arc<Mutex<StoreInner>>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::with_options(MockOptions::default())
    }

    pub fn silent() -> Self {
        Self::with_options(MockOptions {
            silent: true,
            ..MockOptions::default()
        })
    }

    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self::with_options(MockOptions {
            credentials: Some((username.to_string(), password.to_string())),
            ..MockOptions::default()
        })
    }

    pub fn with_options(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(Mutex::new(StoreInner::default()));
        let cas_counter = Arc::new(AtomicU64::new(1));

        let accept_store = store.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let store = accept_store.clone();
                let cas_counter = cas_counter.clone();
                let options = options.clone();
                thread::spawn(move || serve(stream, store, cas_counter, options));
            }
        });

        MockServer { addr, store }
    }

    /// Stored keys, for asserting on key discipline.
    pub fn keys(&self) -> Vec<String> {
        self.store
            .lock()
            .unwrap()
            .entries
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.store
            .lock()
            .unwrap()
            .entries
            .get(key.as_bytes())
            .cloned()
    }

    pub fn flush_delays(&self) -> Vec<u32> {
        self.store.lock().unwrap().flush_delays.clone()
    }
}

fn serve(
    mut stream: TcpStream,
    store: Arc<Mutex<StoreInner>>,
    cas_counter: Arc<AtomicU64>,
    options: MockOptions,
) {
    let mut authenticated = options.credentials.is_none();

    loop {
        let mut header = [0u8; HEADER];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        if header[0] != 0x80 {
            return;
        }
        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let req_cas = u64::from_be_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]);

        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        if options.silent {
            continue;
        }

        let extras = &body[..extras_len];
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = body[extras_len + key_len..].to_vec();

        // SASL gate
        if !authenticated {
            if opcode == 0x21 {
                let (user, pass) = options.credentials.as_ref().unwrap();
                let expected = format!("\0{user}\0{pass}");
                if value == expected.as_bytes() {
                    authenticated = true;
                    respond(&mut stream, opcode, 0, opaque, 0, &[], &[], b"Authenticated");
                } else {
                    respond(&mut stream, opcode, 0x20, opaque, 0, &[], &[], b"Auth failure");
                }
            } else {
                respond(&mut stream, opcode, 0x20, opaque, 0, &[], &[], b"Auth required");
            }
            continue;
        }

        let mut db = store.lock().unwrap();
        match opcode {
            // GET / GETQ / GAT
            0x00 | 0x09 | 0x1D => match db.entries.get(&key) {
                Some(entry) => {
                    let flags = entry.flags.to_be_bytes();
                    respond(
                        &mut stream,
                        opcode,
                        0,
                        opaque,
                        entry.cas,
                        &flags,
                        &[],
                        &entry.value,
                    );
                }
                None => {
                    if opcode != 0x09 {
                        respond(&mut stream, opcode, 1, opaque, 0, &[], &[], b"Not found");
                    }
                }
            },
            // SET / ADD / REPLACE
            0x01 | 0x02 | 0x03 | 0x11 | 0x12 | 0x13 => {
                let quiet = opcode >= 0x11;
                let base = if quiet { opcode - 0x10 } else { opcode };
                let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
                let exists = db.entries.contains_key(&key);

                let status = match base {
                    0x02 if exists => 2,          // add: key exists
                    0x03 if !exists => 1,         // replace: not found
                    0x01 if req_cas != 0 && !exists => 1,
                    0x01 if req_cas != 0 && db.entries[&key].cas != req_cas => 2,
                    _ => 0,
                };

                if status == 0 {
                    let cas = cas_counter.fetch_add(1, Ordering::SeqCst);
                    db.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            flags,
                            cas,
                        },
                    );
                    if !quiet {
                        respond(&mut stream, opcode, 0, opaque, cas, &[], &[], &[]);
                    }
                } else {
                    // Quiet variants do report failures.
                    respond(&mut stream, opcode, status, opaque, 0, &[], &[], b"err");
                }
            }
            // DELETE / DELETEQ
            0x04 | 0x14 => {
                let existed = db.entries.remove(&key).is_some();
                if existed {
                    if opcode == 0x04 {
                        respond(&mut stream, opcode, 0, opaque, 0, &[], &[], &[]);
                    }
                } else {
                    respond(&mut stream, opcode, 1, opaque, 0, &[], &[], b"Not found");
                }
            }
            // INCREMENT / DECREMENT
            0x05 | 0x06 => {
                let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
                let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
                let expiry = u32::from_be_bytes(extras[16..20].try_into().unwrap());

                let current = db.entries.get(&key).map(|e| e.value.clone());
                let new_value = match current {
                    None => {
                        if expiry == u32::MAX {
                            respond(&mut stream, opcode, 1, opaque, 0, &[], &[], b"Not found");
                            continue;
                        }
                        initial
                    }
                    Some(raw) => {
                        let text = String::from_utf8_lossy(&raw);
                        let Ok(current) = text.trim().parse::<u64>() else {
                            respond(&mut stream, opcode, 6, opaque, 0, &[], &[], b"Non-numeric");
                            continue;
                        };
                        if opcode == 0x05 {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        }
                    }
                };

                let cas = cas_counter.fetch_add(1, Ordering::SeqCst);
                db.entries.insert(
                    key.clone(),
                    Entry {
                        value: new_value.to_string().into_bytes(),
                        flags: 0,
                        cas,
                    },
                );
                respond(
                    &mut stream,
                    opcode,
                    0,
                    opaque,
                    cas,
                    &[],
                    &[],
                    &new_value.to_be_bytes(),
                );
            }
            // FLUSH
            0x08 => {
                let delay = if extras_len == 4 {
                    u32::from_be_bytes(extras[0..4].try_into().unwrap())
                } else {
                    0
                };
                db.flush_delays.push(delay);
                db.entries.clear();
                respond(&mut stream, opcode, 0, opaque, 0, &[], &[], &[]);
            }
            // NOOP
            0x0A => respond(&mut stream, opcode, 0, opaque, 0, &[], &[], &[]),
            // VERSION
            0x0B => respond(&mut stream, opcode, 0, opaque, 0, &[], &[], b"1.6.21-mock"),
            // APPEND / PREPEND
            0x0E | 0x0F => match db.entries.get_mut(&key) {
                Some(entry) => {
                    if opcode == 0x0E {
                        entry.value.extend_from_slice(&value);
                    } else {
                        let mut joined = value.clone();
                        joined.extend_from_slice(&entry.value);
                        entry.value = joined;
                    }
                    entry.cas = cas_counter.fetch_add(1, Ordering::SeqCst);
                    let cas = entry.cas;
                    respond(&mut stream, opcode, 0, opaque, cas, &[], &[], &[]);
                }
                None => respond(&mut stream, opcode, 5, opaque, 0, &[], &[], b"Not stored"),
            },
            // STAT
            0x10 => {
                let count = db.entries.len().to_string();
                respond(
                    &mut stream,
                    opcode,
                    0,
                    opaque,
                    0,
                    &[],
                    b"curr_items",
                    count.as_bytes(),
                );
                respond(&mut stream, opcode, 0, opaque, 0, &[], b"version", b"1.6.21-mock");
                respond(&mut stream, opcode, 0, opaque, 0, &[], &[], &[]);
            }
            // TOUCH
            0x1C => {
                if db.entries.contains_key(&key) {
                    respond(&mut stream, opcode, 0, opaque, 0, &[], &[], &[]);
                } else {
                    respond(&mut stream, opcode, 1, opaque, 0, &[], &[], b"Not found");
                }
            }
            _ => respond(&mut stream, opcode, 0x81, opaque, 0, &[], &[], b"Unknown command"),
        }
    }
}

fn respond(
    stream: &mut TcpStream,
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let total = extras.len() + key.len() + value.len();
    let mut frame = vec![0u8; HEADER + total];
    frame[0] = 0x81;
    frame[1] = opcode;
    frame[2..4].copy_from_slice(&(key.len() as u16).to_be_bytes());
    frame[4] = extras.len() as u8;
    frame[6..8].copy_from_slice(&status.to_be_bytes());
    frame[8..12].copy_from_slice(&(total as u32).to_be_bytes());
    frame[12..16].copy_from_slice(&opaque.to_be_bytes());
    frame[16..24].copy_from_slice(&cas.to_be_bytes());
    frame[HEADER..HEADER + extras.len()].copy_from_slice(extras);
    frame[HEADER + extras.len()..HEADER + extras.len() + key.len()].copy_from_slice(key);
    frame[HEADER + extras.len() + key.len()..].copy_from_slice(value);
    let _ = stream.write_all(&frame);
}
