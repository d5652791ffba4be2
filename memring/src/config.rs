//! Client configuration.
//!
//! All knobs live in one bag with defaults matching common deployments; the
//! builder is the supported way to deviate. Serializer choice is a type
//! parameter on [`crate::Client`], not a config field, so typed operations
//! stay monomorphic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Compressor, ZlibCompressor};
use crate::error::Result;
use crate::key::{KeyDigest, Md5Digest};
use crate::servers::{resolve_servers, ServerDescriptor};

/// Key prefix source: fixed, or recomputed on every operation.
#[derive(Clone)]
pub enum NamespaceSource {
    Fixed(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl NamespaceSource {
    /// The namespace for the current operation.
    pub fn resolve(&self) -> String {
        match self {
            NamespaceSource::Fixed(ns) => ns.clone(),
            NamespaceSource::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for NamespaceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceSource::Fixed(ns) => f.debug_tuple("Fixed").field(ns).finish(),
            NamespaceSource::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for NamespaceSource {
    fn from(ns: &str) -> Self {
        NamespaceSource::Fixed(ns.to_string())
    }
}

impl From<String> for NamespaceSource {
    fn from(ns: String) -> Self {
        NamespaceSource::Fixed(ns)
    }
}

/// Resolved client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    pub servers: Vec<ServerDescriptor>,
    pub namespace: Option<NamespaceSource>,
    /// Try other servers when a key's primary is down.
    pub failover: bool,
    /// Serialize multi-key operations across threads with a ring-wide lock.
    pub threadsafe: bool,
    /// Default TTL in seconds; 0 means no expiry.
    pub expires_in: u32,
    pub compress: bool,
    /// Serialized size at which compression kicks in.
    pub compression_min_size: usize,
    pub compressor: Arc<dyn Compressor>,
    /// Distinguish a stored nil from a missing key in `fetch`.
    pub cache_nils: bool,
    /// Digest for over-long keys; must produce hex output.
    pub digest: Arc<dyn KeyDigest>,
    /// Applied to connect, read, and write on every socket.
    pub socket_timeout: Duration,
    /// Consecutive failures before a server is marked down.
    pub socket_max_failures: u32,
    /// Pause between in-operation retries.
    pub socket_failure_delay: Duration,
    /// How long a down server stays out of the ring.
    pub down_retry_delay: Duration,
    /// Client-enforced ceiling on encoded values.
    pub value_max_bytes: usize,
    /// SASL PLAIN credentials; per-server URL credentials take precedence.
    pub username: Option<String>,
    pub password: Option<String>,
    /// TLS parameters; `None` means plaintext.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub keepalive: bool,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("servers", &self.servers)
            .field("namespace", &self.namespace)
            .field("failover", &self.failover)
            .field("threadsafe", &self.threadsafe)
            .field("expires_in", &self.expires_in)
            .field("compress", &self.compress)
            .field("compression_min_size", &self.compression_min_size)
            .field("cache_nils", &self.cache_nils)
            .field("socket_timeout", &self.socket_timeout)
            .field("socket_max_failures", &self.socket_max_failures)
            .field("socket_failure_delay", &self.socket_failure_delay)
            .field("down_retry_delay", &self.down_retry_delay)
            .field("value_max_bytes", &self.value_max_bytes)
            .field("tls", &self.tls.is_some())
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Configuration for an explicit server list (comma-separated entries).
    pub fn for_servers(list: &str) -> Result<Self> {
        Ok(Self::with_descriptors(crate::servers::parse_server_list(
            list,
        )?))
    }

    /// Configuration from `MEMCACHE_SERVERS`, or localhost when unset.
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_descriptors(resolve_servers(None)?))
    }

    fn with_descriptors(servers: Vec<ServerDescriptor>) -> Self {
        ClientConfig {
            servers,
            namespace: None,
            failover: true,
            threadsafe: true,
            expires_in: 0,
            compress: true,
            compression_min_size: 4096,
            compressor: Arc::new(ZlibCompressor),
            cache_nils: false,
            digest: Arc::new(Md5Digest),
            socket_timeout: Duration::from_secs(1),
            socket_max_failures: 2,
            socket_failure_delay: Duration::from_millis(100),
            down_retry_delay: Duration::from_secs(30),
            value_max_bytes: 1024 * 1024,
            username: None,
            password: None,
            tls: None,
            keepalive: true,
            sndbuf: None,
            rcvbuf: None,
        }
    }

    pub fn builder(list: &str) -> Result<ClientConfigBuilder> {
        Ok(ClientConfigBuilder {
            config: Self::for_servers(list)?,
        })
    }
}

/// Builder over [`ClientConfig`].
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn namespace(mut self, ns: impl Into<NamespaceSource>) -> Self {
        self.config.namespace = Some(ns.into());
        self
    }

    /// Namespace recomputed on every operation.
    pub fn namespace_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.config.namespace = Some(NamespaceSource::Dynamic(Arc::new(f)));
        self
    }

    pub fn failover(mut self, failover: bool) -> Self {
        self.config.failover = failover;
        self
    }

    pub fn threadsafe(mut self, threadsafe: bool) -> Self {
        self.config.threadsafe = threadsafe;
        self
    }

    pub fn expires_in(mut self, ttl: u32) -> Self {
        self.config.expires_in = ttl;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    pub fn compression_min_size(mut self, bytes: usize) -> Self {
        self.config.compression_min_size = bytes;
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.config.compressor = compressor;
        self
    }

    pub fn cache_nils(mut self, cache_nils: bool) -> Self {
        self.config.cache_nils = cache_nils;
        self
    }

    pub fn digest(mut self, digest: Arc<dyn KeyDigest>) -> Self {
        self.config.digest = digest;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    pub fn socket_max_failures(mut self, failures: u32) -> Self {
        self.config.socket_max_failures = failures.max(1);
        self
    }

    pub fn socket_failure_delay(mut self, delay: Duration) -> Self {
        self.config.socket_failure_delay = delay;
        self
    }

    pub fn down_retry_delay(mut self, delay: Duration) -> Self {
        self.config.down_retry_delay = delay;
        self
    }

    pub fn value_max_bytes(mut self, bytes: usize) -> Self {
        self.config.value_max_bytes = bytes;
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.config.username = Some(username.to_string());
        self.config.password = Some(password.to_string());
        self
    }

    pub fn tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    pub fn sndbuf(mut self, bytes: usize) -> Self {
        self.config.sndbuf = Some(bytes);
        self
    }

    pub fn rcvbuf(mut self, bytes: usize) -> Self {
        self.config.rcvbuf = Some(bytes);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
