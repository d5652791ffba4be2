//! A blocking memcached client with consistent hashing, pipelined
//! multi-get, CAS, and transparent failover.
//!
//! Keys fan out across a weighted ketama ring; each server gets one
//! connection with its own state machine, retry policy, and down timer.
//! Values pass through a pluggable serializer (serde_json by default) with
//! optional zlib compression above a size threshold. Multi-key reads
//! pipeline quiet gets per server and drain all sockets at once under a
//! single deadline.
//!
//! The client is thread-per-caller: every operation blocks until its
//! response or the socket timeout. Share a client behind `Arc`, or pool
//! clients when you need more parallelism per server.
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> memring::Result<()> {
//! let client = memring::Client::for_servers("cache-1:11211,cache-2:11211:2")?;
//!
//! client.set("greeting", &"hello", None)?;
//! let greeting: Option<String> = client.get("greeting")?;
//! assert_eq!(greeting.as_deref(), Some("hello"));
//!
//! let hits: std::collections::HashMap<String, String> =
//!     client.get_multi(&["greeting", "absent"])?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

mod client;
mod codec;
mod config;
mod connection;
mod error;
mod key;
mod multi;
mod pipeline;
mod ring;
mod servers;

pub use client::{CasResult, Client};
pub use codec::{
    Compressor, JsonSerializer, Serializer, ZlibCompressor, FLAG_COMPRESSED, FLAG_SERIALIZED,
};
pub use config::{ClientConfig, ClientConfigBuilder, NamespaceSource};
pub use error::{Error, Result};
pub use key::{KeyDigest, Md5Digest, MAX_KEY_BYTES};
pub use pipeline::Pipeline;
pub use servers::{parse_server_list, ServerAddress, ServerDescriptor, SERVERS_ENV};
