//! Ketama consistent hash ring over the configured servers.
//!
//! Each server contributes `160 * weight` points, hashed from
//! `"<name>:<index>"`. A key maps to the owner of the smallest point at or
//! after its own hash, wrapping at the top. Down servers keep their points
//! (so recovery restores the original layout) but lookups skip them; with
//! failover enabled the walk continues through successive points until a
//! live candidate turns up.

use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::{Mutex, MutexGuard};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Virtual points per unit of weight, the standard ketama density.
const POINTS_PER_WEIGHT: usize = 160;

#[derive(Debug, Clone, Copy)]
struct Point {
    hash: u32,
    server: u16,
}

pub(crate) struct Ring {
    servers: Vec<Arc<Mutex<Connection>>>,
    names: Vec<String>,
    continuum: Vec<Point>,
    failover: bool,
    threadsafe: bool,
    /// Serializes multi-key operations, which hold several sockets at once.
    multi_lock: Mutex<()>,
}

impl Ring {
    pub fn new(config: &Arc<ClientConfig>) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(Error::Ring("no servers configured".into()));
        }

        let mut servers = Vec::with_capacity(config.servers.len());
        let mut names = Vec::with_capacity(config.servers.len());
        let mut continuum = Vec::new();

        for (idx, descriptor) in config.servers.iter().enumerate() {
            let name = descriptor.name();
            for i in 0..POINTS_PER_WEIGHT * descriptor.weight as usize {
                let point = hash_point(format!("{name}:{i}").as_bytes());
                continuum.push(Point {
                    hash: point,
                    server: idx as u16,
                });
            }
            names.push(name);
            servers.push(Arc::new(Mutex::new(Connection::new(
                descriptor.clone(),
                config.clone(),
            ))));
        }

        continuum.sort_unstable_by_key(|p| (p.hash, p.server));

        Ok(Ring {
            servers,
            names,
            continuum,
            failover: config.failover,
            threadsafe: config.threadsafe,
            multi_lock: Mutex::new(()),
        })
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn server_name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn connection(&self, idx: usize) -> &Arc<Mutex<Connection>> {
        &self.servers[idx]
    }

    /// Map a key to a live server index.
    pub fn server_for_key(&self, key: &str) -> Result<usize> {
        let h = hash_point(key.as_bytes());
        let len = self.continuum.len();
        let start = self.continuum.partition_point(|p| p.hash < h) % len;

        let owner = self.continuum[start].server as usize;
        if self.server_alive(owner) {
            return Ok(owner);
        }
        if !self.failover {
            return Err(Error::Ring(format!(
                "server {} is down for key {key:?}",
                self.names[owner]
            )));
        }

        // Walk successive points, probing each distinct candidate once.
        let mut seen = vec![false; self.servers.len()];
        seen[owner] = true;
        let mut probed = 1;
        for offset in 1..len {
            let candidate = self.continuum[(start + offset) % len].server as usize;
            if seen[candidate] {
                continue;
            }
            seen[candidate] = true;
            if self.server_alive(candidate) {
                return Ok(candidate);
            }
            probed += 1;
            if probed == self.servers.len() {
                break;
            }
        }
        Err(Error::Ring("no live server available".into()))
    }

    fn server_alive(&self, idx: usize) -> bool {
        self.servers[idx].lock().alive()
    }

    /// True when at least one server is routable.
    pub fn any_alive(&self) -> bool {
        (0..self.servers.len()).any(|idx| self.server_alive(idx))
    }

    /// Exclusive scope for operations holding multiple sockets. A no-op when
    /// `threadsafe` is off: the caller is promising single-threaded use.
    pub fn multi_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.threadsafe.then(|| self.multi_lock.lock())
    }

    /// Close every connection; called when the ring is discarded.
    pub fn close_all(&self) {
        for server in &self.servers {
            server.lock().close();
        }
    }
}

/// First four bytes of the MD5 digest, little-endian, libmemcached-style.
fn hash_point(data: &[u8]) -> u32 {
    let digest = Md5::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_for(list: &str) -> Ring {
        let config = Arc::new(ClientConfig::for_servers(list).unwrap());
        Ring::new(&config).unwrap()
    }

    fn ring_for_config(config: ClientConfig) -> Ring {
        Ring::new(&Arc::new(config)).unwrap()
    }

    #[test]
    fn point_counts_follow_weight() {
        let ring = ring_for("s0:11211,s1:11211:3");
        assert_eq!(ring.continuum.len(), 160 + 480);
        assert_eq!(ring.server_count(), 2);
    }

    #[test]
    fn deterministic_routing() {
        let ring = ring_for("s0:11211,s1:11211,s2:11211");
        let a = ring.server_for_key("test-key").unwrap();
        let b = ring.server_for_key("test-key").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn roughly_uniform_distribution() {
        let ring = ring_for("s0:11211,s1:11211,s2:11211");
        let mut counts = [0u32; 3];
        for i in 0..10_000u32 {
            counts[ring.server_for_key(&format!("key-{i}")).unwrap()] += 1;
        }
        for (i, &count) in counts.iter().enumerate() {
            assert!(
                (2500..=4500).contains(&count),
                "server {i} got {count} of 10k keys: {counts:?}"
            );
        }
    }

    #[test]
    fn weighted_distribution() {
        let ring = ring_for("s0:11211,s1:11211:2");
        let mut counts = [0u32; 2];
        for i in 0..10_000u32 {
            counts[ring.server_for_key(&format!("key-{i}")).unwrap()] += 1;
        }
        let ratio = counts[1] as f64 / counts[0] as f64;
        assert!(
            (1.5..2.5).contains(&ratio),
            "weight ratio {ratio:.2}: {counts:?}"
        );
    }

    #[test]
    fn minimal_remapping_on_server_add() {
        let ring3 = ring_for("s0:11211,s1:11211,s2:11211");
        let ring4 = ring_for("s0:11211,s1:11211,s2:11211,s3:11211");

        let total = 10_000u32;
        let mut remapped = 0u32;
        for i in 0..total {
            let key = format!("key-{i}");
            let a = ring3.server_for_key(&key).unwrap();
            let b = ring4.server_for_key(&key).unwrap();
            // Server indices agree across the two rings for shared servers.
            if a != b {
                remapped += 1;
            }
        }
        let pct = remapped as f64 / total as f64;
        assert!(pct < 0.40, "remapped {pct:.2} of keys");
    }

    #[test]
    fn failover_skips_dead_server() {
        let ring = ring_for("s0:11211,s1:11211");

        // Find a key owned by server 0, then kill server 0.
        let key = (0..)
            .map(|i| format!("probe-{i}"))
            .find(|k| ring.server_for_key(k).unwrap() == 0)
            .unwrap();
        ring.connection(0).lock().close();

        assert_eq!(ring.server_for_key(&key).unwrap(), 1);
        assert!(ring.any_alive());
    }

    #[test]
    fn no_failover_means_ring_error_for_dead_owner() {
        let mut config = ClientConfig::for_servers("s0:11211,s1:11211").unwrap();
        config.failover = false;
        let ring = ring_for_config(config);

        let key = (0..)
            .map(|i| format!("probe-{i}"))
            .find(|k| ring.server_for_key(k).unwrap() == 0)
            .unwrap();
        ring.connection(0).lock().close();

        assert!(matches!(ring.server_for_key(&key), Err(Error::Ring(_))));
    }

    #[test]
    fn all_dead_is_ring_error() {
        let ring = ring_for("s0:11211,s1:11211");
        ring.connection(0).lock().close();
        ring.connection(1).lock().close();

        assert!(!ring.any_alive());
        assert!(matches!(
            ring.server_for_key("any-key"),
            Err(Error::Ring(_))
        ));
    }

    #[test]
    fn empty_server_list_is_rejected() {
        let mut config = ClientConfig::for_servers("s0:11211").unwrap();
        config.servers.clear();
        assert!(matches!(
            Ring::new(&Arc::new(config)),
            Err(Error::Ring(_))
        ));
    }

    #[test]
    fn continuum_is_sorted() {
        let ring = ring_for("s0:11211,s1:11211");
        assert!(ring.continuum.windows(2).all(|w| w[0].hash <= w[1].hash));
    }
}
