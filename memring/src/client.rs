//! Client facade and request chokepoint.
//!
//! Every single-key operation funnels through [`Client::perform`]: normalize
//! the key, resolve the owning server through the ring, dispatch on its
//! connection, and retry exactly once through the ring on a network error
//! (the failed server is marked down by then, so the retry lands elsewhere).
//! Multi-get bypasses this path and uses the coordinator directly.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use memring_wire::{Opcode, Response, Status};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{JsonSerializer, Serializer, ValueCodec, FLAG_SERIALIZED};
use crate::config::ClientConfig;
use crate::connection::Op;
use crate::error::{Error, Result};
use crate::key;
use crate::multi;
use crate::ring::Ring;

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// Stored; the token matched.
    Updated,
    /// Another writer got there first; the token no longer matches.
    Conflict,
    /// The key does not exist.
    Missing,
}

/// A memcached client over a weighted consistent-hash ring.
///
/// The ring is built lazily on first use and discarded by
/// [`reset`](Client::reset) / [`close`](Client::close). The client is
/// `Send + Sync`; clone-free sharing via `Arc` is the intended pattern,
/// with a pool of clients when more parallelism per server is needed.
pub struct Client<S: Serializer = JsonSerializer> {
    config: Arc<ClientConfig>,
    serializer: S,
    ring: RwLock<Option<Arc<Ring>>>,
}

impl Client<JsonSerializer> {
    /// Client over `MEMCACHE_SERVERS`, or `127.0.0.1:11211` when unset.
    pub fn new() -> Result<Self> {
        Self::from_config(ClientConfig::from_env()?)
    }

    /// Client over an explicit comma-separated server list.
    pub fn for_servers(list: &str) -> Result<Self> {
        Self::from_config(ClientConfig::for_servers(list)?)
    }

    pub fn from_config(config: ClientConfig) -> Result<Self> {
        Ok(Self::with_serializer(config, JsonSerializer))
    }
}

impl<S: Serializer> Client<S> {
    /// Client with a non-default serializer.
    pub fn with_serializer(config: ClientConfig, serializer: S) -> Self {
        Client {
            config: Arc::new(config),
            serializer,
            ring: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -- Ring lifecycle ------------------------------------------------------

    pub(crate) fn ring(&self) -> Result<Arc<Ring>> {
        if let Some(ring) = self.ring.read().as_ref() {
            return Ok(ring.clone());
        }
        let mut slot = self.ring.write();
        if let Some(ring) = slot.as_ref() {
            return Ok(ring.clone());
        }
        let ring = Arc::new(Ring::new(&self.config)?);
        *slot = Some(ring.clone());
        Ok(ring)
    }

    /// Probe the ring; errors when no server is alive.
    pub fn ensure_alive(&self) -> Result<()> {
        let ring = self.ring()?;
        if ring.any_alive() {
            Ok(())
        } else {
            Err(Error::Ring("no server is alive".into()))
        }
    }

    /// Recycle: close every connection and discard the ring. The next
    /// operation rebuilds both.
    pub fn reset(&self) {
        self.drop_ring();
    }

    /// End-of-life shutdown: close every connection and discard the ring.
    /// Unlike [`reset`](Client::reset) this is meant as the final call, but
    /// a later operation will still rebuild rather than panic.
    pub fn close(&self) {
        self.drop_ring();
    }

    fn drop_ring(&self) {
        if let Some(ring) = self.ring.write().take() {
            ring.close_all();
        }
    }

    // -- Chokepoint ----------------------------------------------------------

    fn perform(&self, routing_key: &str, op: &Op<'_>) -> Result<Response> {
        let ring = self.ring()?;
        let mut retried = false;
        loop {
            let idx = ring.server_for_key(routing_key)?;
            match ring.connection(idx).lock().request(op) {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_network() && !retried => {
                    retried = true;
                    debug!(key = routing_key, error = %err, "retrying through ring");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn codec(&self) -> ValueCodec<'_, S> {
        ValueCodec {
            serializer: &self.serializer,
            compressor: &*self.config.compressor,
            compress: self.config.compress,
            compression_min_size: self.config.compression_min_size,
            value_max_bytes: self.config.value_max_bytes,
        }
    }

    pub(crate) fn encode_value<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, u32)> {
        self.codec().encode(value)
    }

    pub(crate) fn namespace(&self) -> Option<String> {
        key::resolve_namespace(&self.config.namespace)
    }

    pub(crate) fn normalize(&self, key: &str, namespace: Option<&str>) -> Result<String> {
        key::normalize(key, namespace, &*self.config.digest)
    }

    fn normalized(&self, key: &str) -> Result<String> {
        let ns = self.namespace();
        self.normalize(key, ns.as_deref())
    }

    pub(crate) fn ttl_or_default(&self, ttl: Option<u32>) -> u32 {
        ttl.unwrap_or(self.config.expires_in)
    }

    fn entry(&self, key: &str) -> Result<Option<(Bytes, u32, u64)>> {
        let nkey = self.normalized(key)?;
        let resp = self.perform(&nkey, &Op::Get { key: &nkey })?;
        if resp.is_miss() {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(status_error(resp.status));
        }
        Ok(Some((resp.value, resp.flags, resp.cas)))
    }

    // -- Reads ---------------------------------------------------------------

    /// Fetch and decode a value. `None` on miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.entry(key)? {
            Some((payload, flags, _)) => Ok(Some(self.codec().decode(&payload, flags)?)),
            None => Ok(None),
        }
    }

    /// Fetch a value together with its CAS token.
    pub fn get_cas<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.entry(key)? {
            Some((payload, flags, cas)) => {
                Ok(Some((self.codec().decode(&payload, flags)?, cas)))
            }
            None => Ok(None),
        }
    }

    /// Fetch stored bytes verbatim, without the codec.
    pub fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entry(key)?.map(|(payload, _, _)| payload))
    }

    /// Fetch and refresh the expiry in one round trip. `None` on miss.
    pub fn gat<T: DeserializeOwned>(&self, key: &str, ttl: Option<u32>) -> Result<Option<T>> {
        let nkey = self.normalized(key)?;
        let expiry = self.ttl_or_default(ttl);
        let resp = self.perform(&nkey, &Op::Gat { key: &nkey, expiry })?;
        if resp.is_miss() {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(status_error(resp.status));
        }
        Ok(Some(self.codec().decode(&resp.value, resp.flags)?))
    }

    // -- Writes --------------------------------------------------------------

    fn store<T: Serialize>(
        &self,
        opcode: Opcode,
        key: &str,
        value: &T,
        ttl: Option<u32>,
        cas: u64,
    ) -> Result<Response> {
        let nkey = self.normalized(key)?;
        let (payload, flags) = self.codec().encode(value)?;
        let op = Op::Store {
            opcode,
            key: &nkey,
            value: &payload,
            flags,
            expiry: self.ttl_or_default(ttl),
            cas,
        };
        self.perform(&nkey, &op)
    }

    /// Store unconditionally. Returns the new CAS token.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u32>) -> Result<u64> {
        let resp = self.store(Opcode::Set, key, value, ttl, 0)?;
        if resp.is_success() {
            Ok(resp.cas)
        } else {
            Err(status_error(resp.status))
        }
    }

    /// Store only when the CAS token still matches.
    pub fn set_cas<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u32>,
        cas: u64,
    ) -> Result<CasResult> {
        let resp = self.store(Opcode::Set, key, value, ttl, cas)?;
        match resp.status {
            Status::NoError => Ok(CasResult::Updated),
            Status::KeyExists => Ok(CasResult::Conflict),
            Status::KeyNotFound => Ok(CasResult::Missing),
            status => Err(status_error(status)),
        }
    }

    /// Store only when absent. `false` when the key already exists, so under
    /// concurrent misses exactly one producer's value survives.
    pub fn add<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u32>) -> Result<bool> {
        let resp = self.store(Opcode::Add, key, value, ttl, 0)?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::KeyExists | Status::NotStored => Ok(false),
            status => Err(status_error(status)),
        }
    }

    /// Store only when present. `false` when the key is missing.
    pub fn replace<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u32>) -> Result<bool> {
        let resp = self.store(Opcode::Replace, key, value, ttl, 0)?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::KeyNotFound | Status::NotStored => Ok(false),
            status => Err(status_error(status)),
        }
    }

    /// Store bytes verbatim (no serialization, no compression).
    pub fn set_raw(&self, key: &str, value: &[u8], ttl: Option<u32>) -> Result<u64> {
        let nkey = self.normalized(key)?;
        let (payload, flags) = self.codec().encode_raw(value)?;
        let op = Op::Store {
            opcode: Opcode::Set,
            key: &nkey,
            value: &payload,
            flags,
            expiry: self.ttl_or_default(ttl),
            cas: 0,
        };
        let resp = self.perform(&nkey, &op)?;
        if resp.is_success() {
            Ok(resp.cas)
        } else {
            Err(status_error(resp.status))
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let nkey = self.normalized(key)?;
        let op = Op::Delete {
            opcode: Opcode::Delete,
            key: &nkey,
            cas: 0,
        };
        let resp = self.perform(&nkey, &op)?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::KeyNotFound => Ok(false),
            status => Err(status_error(status)),
        }
    }

    fn concat(&self, opcode: Opcode, key: &str, value: &[u8]) -> Result<bool> {
        let nkey = self.normalized(key)?;
        let op = Op::Concat {
            opcode,
            key: &nkey,
            value,
        };
        let resp = self.perform(&nkey, &op)?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::NotStored | Status::KeyNotFound => Ok(false),
            status => Err(status_error(status)),
        }
    }

    /// Append raw bytes to an existing value. `false` when absent.
    pub fn append(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.concat(Opcode::Append, key, value)
    }

    /// Prepend raw bytes to an existing value. `false` when absent.
    pub fn prepend(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.concat(Opcode::Prepend, key, value)
    }

    /// Refresh a key's expiry. `false` when absent.
    pub fn touch(&self, key: &str, ttl: Option<u32>) -> Result<bool> {
        let nkey = self.normalized(key)?;
        let op = Op::Touch {
            key: &nkey,
            expiry: self.ttl_or_default(ttl),
        };
        let resp = self.perform(&nkey, &op)?;
        match resp.status {
            Status::NoError => Ok(true),
            Status::KeyNotFound => Ok(false),
            status => Err(status_error(status)),
        }
    }

    // -- Counters ------------------------------------------------------------

    fn counter_op(
        &self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        ttl: Option<u32>,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        let nkey = self.normalized(key)?;
        let op = Op::Counter {
            opcode,
            key: &nkey,
            delta,
            initial,
            expiry: self.ttl_or_default(ttl),
        };
        let resp = self.perform(&nkey, &op)?;
        if resp.is_miss() {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(status_error(resp.status));
        }
        resp.counter_value()
            .map(Some)
            .ok_or_else(|| Error::Protocol("counter response without a 64-bit body".into()))
    }

    /// Increment a counter; `None` when the key is absent.
    pub fn incr(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter_op(Opcode::Increment, key, delta, None, None)
    }

    /// Increment, optionally seeding an absent key with `initial`.
    pub fn incr_with(
        &self,
        key: &str,
        delta: u64,
        ttl: Option<u32>,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        self.counter_op(Opcode::Increment, key, delta, ttl, initial)
    }

    /// Decrement a counter, clamping at zero; `None` when the key is absent.
    pub fn decr(&self, key: &str, delta: u64) -> Result<Option<u64>> {
        self.counter_op(Opcode::Decrement, key, delta, None, None)
    }

    /// Decrement, optionally seeding an absent key with `initial`.
    pub fn decr_with(
        &self,
        key: &str,
        delta: u64,
        ttl: Option<u32>,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        self.counter_op(Opcode::Decrement, key, delta, ttl, initial)
    }

    // -- Read-through and CAS ------------------------------------------------

    /// Read-through: on miss, produce a value and `add` it (first producer
    /// wins under concurrent misses).
    ///
    /// A cached nil counts as a miss unless `cache_nils` is configured. An
    /// undecodable entry is treated as missing: the producer runs and its
    /// value is returned, though the stored entry stays until overwritten.
    pub fn fetch<T, F>(&self, key: &str, ttl: Option<u32>, produce: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some((payload, flags, _)) = self.entry(key)? {
            let codec = self.codec();
            match codec.decompressed(&payload, flags) {
                Ok(plain) => {
                    let cached_nil = flags & FLAG_SERIALIZED != 0
                        && self.serializer.is_nil(&plain)
                        && !self.config.cache_nils;
                    if !cached_nil {
                        match self.serializer.from_bytes::<T>(&plain) {
                            Ok(value) => return Ok(value),
                            Err(err) => {
                                warn!(key, error = %err, "treating undecodable entry as a miss")
                            }
                        }
                    }
                }
                Err(err) => warn!(key, error = %err, "treating undecodable entry as a miss"),
            }
        }

        let value = produce();
        self.add(key, &value, ttl)?;
        Ok(value)
    }

    /// Optimistic read-modify-write. The producer sees the current value;
    /// the follow-up store carries the read's token. `Missing` when the key
    /// is absent (the producer is not called).
    pub fn cas<T, F>(&self, key: &str, ttl: Option<u32>, produce: F) -> Result<CasResult>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let Some((payload, flags, token)) = self.entry(key)? else {
            return Ok(CasResult::Missing);
        };
        let current = self.codec().decode(&payload, flags)?;
        let next = produce(current);
        self.set_cas(key, &next, ttl, token)
    }

    /// Like [`cas`](Client::cas), but the producer is called even when the
    /// key is absent; the follow-up store is then unconditional (token 0).
    pub fn cas_upsert<T, F>(&self, key: &str, ttl: Option<u32>, produce: F) -> Result<CasResult>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let (current, token) = match self.entry(key)? {
            Some((payload, flags, token)) => {
                (Some(self.codec().decode(&payload, flags)?), token)
            }
            None => (None, 0),
        };
        let next = produce(current);
        self.set_cas(key, &next, ttl, token)
    }

    // -- Multi-get -----------------------------------------------------------

    /// Fetch many keys at once, pipelined per server. The map holds only
    /// hits on live servers; results carry the original (pre-namespace) key.
    pub fn get_multi<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<HashMap<String, T>> {
        let mut out = HashMap::new();
        self.get_multi_each(keys, |key, value, _cas| {
            out.insert(key.to_string(), value);
        })?;
        Ok(out)
    }

    /// Multi-get variant carrying each hit's CAS token.
    pub fn get_multi_cas<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, (T, u64)>> {
        let mut out = HashMap::new();
        self.get_multi_each(keys, |key, value, cas| {
            out.insert(key.to_string(), (value, cas));
        })?;
        Ok(out)
    }

    /// Streaming multi-get: `each` runs for every hit as it is drained.
    pub fn get_multi_each<T, F>(&self, keys: &[&str], mut each: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T, u64),
    {
        if keys.is_empty() {
            return Ok(());
        }
        let ns = self.namespace();
        let mut normalized = Vec::with_capacity(keys.len());
        for k in keys {
            normalized.push(self.normalize(k, ns.as_deref())?);
        }

        let ring = self.ring()?;
        let codec = self.codec();
        let mut emit = |nkey: &str, resp: Response| {
            let original = key::denormalize(nkey, ns.as_deref());
            match codec.decode::<T>(&resp.value, resp.flags) {
                Ok(value) => each(original, value, resp.cas),
                Err(err) => {
                    warn!(key = original, error = %err, "dropping undecodable multi-get value")
                }
            }
        };
        multi::multi_get(&ring, &self.config, normalized, &mut emit)
    }

    // -- Fan-out -------------------------------------------------------------

    /// Per-server stats; a down server maps to `None`.
    pub fn stats(
        &self,
        group: Option<&str>,
    ) -> Result<HashMap<String, Option<HashMap<String, String>>>> {
        let ring = self.ring()?;
        let mut out = HashMap::new();
        for idx in 0..ring.server_count() {
            let name = ring.server_name(idx).to_string();
            match ring.connection(idx).lock().stats(group) {
                Ok(entries) => {
                    out.insert(name, Some(entries.into_iter().collect()));
                }
                Err(err) => {
                    debug!(server = ring.server_name(idx), error = %err, "stats unavailable");
                    out.insert(name, None);
                }
            }
        }
        Ok(out)
    }

    /// Per-server version string; a down server maps to `None`.
    pub fn version(&self) -> Result<HashMap<String, Option<String>>> {
        let ring = self.ring()?;
        let mut out = HashMap::new();
        for idx in 0..ring.server_count() {
            let name = ring.server_name(idx).to_string();
            match ring.connection(idx).lock().request(&Op::Version) {
                Ok(resp) if resp.is_success() => {
                    out.insert(name, Some(String::from_utf8_lossy(&resp.value).into_owned()));
                }
                Ok(resp) => {
                    debug!(server = ring.server_name(idx), status = resp.status.as_str(), "version failed");
                    out.insert(name, None);
                }
                Err(err) => {
                    debug!(server = ring.server_name(idx), error = %err, "version unavailable");
                    out.insert(name, None);
                }
            }
        }
        Ok(out)
    }

    /// Flush every server, staggering expiry by `delay` seconds per server
    /// (first immediately, second after `delay`, third after `2 * delay`)
    /// so the caches do not all empty at once.
    pub fn flush(&self, delay: u32) -> Result<()> {
        let ring = self.ring()?;
        for idx in 0..ring.server_count() {
            let op = Op::Flush {
                delay: delay * idx as u32,
            };
            let resp = ring.connection(idx).lock().request(&op)?;
            if !resp.is_success() {
                return Err(status_error(resp.status));
            }
        }
        Ok(())
    }
}

/// Map a server-reported failure status onto the client taxonomy.
fn status_error(status: Status) -> Error {
    match status {
        Status::InvalidArguments | Status::NonNumericValue => {
            Error::InvalidArgument(format!("server rejected request: {}", status.as_str()))
        }
        status => Error::Protocol(format!("unexpected response status: {}", status.as_str())),
    }
}
