//! Explicit quiet-write batch scope.
//!
//! Quiet store/delete variants suppress success responses, so a batch of
//! them costs one socket write per operation and a single NOOP-terminated
//! drain per touched server at scope exit. The scope is an explicit value
//! passed to the closure; there is no ambient per-thread batching state.
//!
//! ```no_run
//! # fn main() -> memring::Result<()> {
//! let client = memring::Client::for_servers("127.0.0.1:11211")?;
//! client.pipelined(|batch| {
//!     batch.set("a", &1u32, None)?;
//!     batch.set("b", &2u32, None)?;
//!     batch.delete("stale")?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

use memring_wire::Opcode;
use serde::Serialize;
use tracing::warn;

use crate::client::Client;
use crate::codec::Serializer;
use crate::connection::Op;
use crate::error::Result;
use crate::ring::Ring;

/// Handle for queueing quiet writes inside [`Client::pipelined`].
pub struct Pipeline<'a, S: Serializer> {
    client: &'a Client<S>,
    ring: &'a Ring,
    namespace: Option<String>,
    /// Server indices with quiet operations in flight, in first-use order.
    touched: Vec<usize>,
}

impl<S: Serializer> Client<S> {
    /// Run `scope` with a quiet-write batch, then drain every touched
    /// server.
    ///
    /// Server error responses to quiet operations (an `add` of an existing
    /// key, a `delete` of a missing one) are logged and swallowed; transport
    /// failures propagate. The ring-wide lock is held for the whole scope
    /// when `threadsafe` is on.
    pub fn pipelined<F>(&self, scope: F) -> Result<()>
    where
        F: FnOnce(&mut Pipeline<'_, S>) -> Result<()>,
    {
        let ring = self.ring()?;
        let _scope = ring.multi_guard();
        let mut pipeline = Pipeline {
            client: self,
            ring: &ring,
            namespace: self.namespace(),
            touched: Vec::new(),
        };
        let body = scope(&mut pipeline);
        let drain = pipeline.finish();
        body.and(drain)
    }
}

impl<S: Serializer> Pipeline<'_, S> {
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T, ttl: Option<u32>) -> Result<()> {
        self.store(Opcode::SetQ, key, value, ttl)
    }

    pub fn add<T: Serialize>(&mut self, key: &str, value: &T, ttl: Option<u32>) -> Result<()> {
        self.store(Opcode::AddQ, key, value, ttl)
    }

    pub fn replace<T: Serialize>(&mut self, key: &str, value: &T, ttl: Option<u32>) -> Result<()> {
        self.store(Opcode::ReplaceQ, key, value, ttl)
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let nkey = self.client.normalize(key, self.namespace.as_deref())?;
        self.dispatch(&Op::Delete {
            opcode: Opcode::DeleteQ,
            key: &nkey,
            cas: 0,
        })
    }

    fn store<T: Serialize>(
        &mut self,
        opcode: Opcode,
        key: &str,
        value: &T,
        ttl: Option<u32>,
    ) -> Result<()> {
        let nkey = self.client.normalize(key, self.namespace.as_deref())?;
        let (payload, flags) = self.client.encode_value(value)?;
        self.dispatch(&Op::Store {
            opcode,
            key: &nkey,
            value: &payload,
            flags,
            expiry: self.client.ttl_or_default(ttl),
            cas: 0,
        })
    }

    fn dispatch(&mut self, op: &Op<'_>) -> Result<()> {
        // Quiet ops always carry a key.
        let routing_key = op.key().unwrap_or_default();
        let idx = self.ring.server_for_key(routing_key)?;
        self.ring.connection(idx).lock().pipeline_op(op)?;
        if !self.touched.contains(&idx) {
            self.touched.push(idx);
        }
        Ok(())
    }

    /// Write a NOOP per touched server and drain quiet error responses.
    fn finish(self) -> Result<()> {
        let mut first_err = None;
        for idx in self.touched {
            if let Err(err) = self.ring.connection(idx).lock().pipeline_finish() {
                warn!(server = self.ring.server_name(idx), error = %err, "pipeline drain failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
