//! Key validation, namespacing, and length discipline.
//!
//! The wire limit on keys is 250 bytes of printable, whitespace-free ASCII.
//! Keys that exceed it after namespacing are replaced by a truncated prefix
//! plus an `:md5:` hex digest of the full key, sized to stay under the limit.

use md5::{Digest, Md5};

use crate::config::NamespaceSource;
use crate::error::{Error, Result};

/// Maximum key length the protocol accepts.
pub const MAX_KEY_BYTES: usize = 250;

// 212 leaves room for ":md5:" plus a 32-hex-character digest.
const PREFIX_KEEP: usize = 212;
const DIGEST_MARKER: &str = ":md5:";

/// Digest capability for over-long keys. Output must be hex.
pub trait KeyDigest: Send + Sync {
    fn hex_digest(&self, data: &[u8]) -> String;
}

/// Default digest.
pub struct Md5Digest;

impl KeyDigest for Md5Digest {
    fn hex_digest(&self, data: &[u8]) -> String {
        let digest = Md5::digest(data);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// Validate and namespace a key for the wire.
///
/// `namespace` is resolved by the caller once per operation so dynamic
/// sources observe each call.
pub fn normalize(key: &str, namespace: Option<&str>, digest: &dyn KeyDigest) -> Result<String> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key is empty".into()));
    }

    let full = match namespace {
        Some(ns) => format!("{ns}:{key}"),
        None => key.to_string(),
    };

    if let Some(bad) = full.bytes().find(|&b| b < 0x21 || b == 0x7F) {
        return Err(Error::InvalidKey(format!(
            "key contains forbidden byte {bad:#04x}"
        )));
    }

    if full.len() <= MAX_KEY_BYTES {
        return Ok(full);
    }

    let ns_len = namespace.map_or(0, str::len);
    let keep = PREFIX_KEEP.saturating_sub(ns_len).min(full.len());
    let hex = digest.hex_digest(full.as_bytes());
    let shortened = format!("{}{DIGEST_MARKER}{hex}", &full[..keep]);
    if shortened.len() > MAX_KEY_BYTES {
        // Only reachable with an oversized digest or namespace.
        return Err(Error::InvalidKey(format!(
            "key still {} bytes after digesting",
            shortened.len()
        )));
    }
    Ok(shortened)
}

/// Strip the leading `namespace:` once, for response keys in multi-get.
pub fn denormalize<'a>(key: &'a str, namespace: Option<&str>) -> &'a str {
    match namespace {
        Some(ns) => {
            let prefix_len = ns.len() + 1;
            if key.len() > prefix_len && key.starts_with(ns) && key.as_bytes()[ns.len()] == b':' {
                &key[prefix_len..]
            } else {
                key
            }
        }
        None => key,
    }
}

/// Resolve the configured namespace for one operation.
pub(crate) fn resolve_namespace(source: &Option<NamespaceSource>) -> Option<String> {
    source.as_ref().map(NamespaceSource::resolve)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_key_passes_through() {
        assert_eq!(normalize("abc", None, &Md5Digest).unwrap(), "abc");
    }

    #[test]
    fn namespace_prefixes_with_colon() {
        assert_eq!(normalize("abc", Some("ns"), &Md5Digest).unwrap(), "ns:abc");
    }

    #[test]
    fn empty_key_is_invalid() {
        assert!(matches!(
            normalize("", None, &Md5Digest),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn whitespace_and_control_bytes_are_invalid() {
        for key in ["a b", "a\tb", "a\nb", "a\x7fb", "a\x00b"] {
            assert!(
                matches!(normalize(key, None, &Md5Digest), Err(Error::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn long_key_is_digested_under_limit() {
        let key = "x".repeat(300);
        let normalized = normalize(&key, Some("ns"), &Md5Digest).unwrap();

        assert!(normalized.len() <= MAX_KEY_BYTES);
        assert!(normalized.starts_with("ns:x"));
        let (prefix, hex) = normalized.split_once(":md5:").unwrap();
        assert_eq!(prefix.len(), PREFIX_KEEP - 2);
        assert_eq!(hex.len(), 32);
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn long_key_digest_is_stable() {
        let key = "y".repeat(400);
        let a = normalize(&key, Some("app"), &Md5Digest).unwrap();
        let b = normalize(&key, Some("app"), &Md5Digest).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn boundary_key_is_not_digested() {
        let key = "k".repeat(MAX_KEY_BYTES - 3); // "ns:" + 247 = 250
        let normalized = normalize(&key, Some("ns"), &Md5Digest).unwrap();
        assert_eq!(normalized.len(), MAX_KEY_BYTES);
        assert!(!normalized.contains(":md5:"));
    }

    #[test]
    fn denormalize_inverts_normalize_for_short_keys() {
        let normalized = normalize("user.42", Some("app"), &Md5Digest).unwrap();
        assert_eq!(denormalize(&normalized, Some("app")), "user.42");
    }

    #[test]
    fn denormalize_strips_at_most_once() {
        assert_eq!(denormalize("ns:ns:k", Some("ns")), "ns:k");
        assert_eq!(denormalize("other:k", Some("ns")), "other:k");
        assert_eq!(denormalize("k", None), "k");
    }

    #[test]
    fn md5_hex_is_lowercase_hex() {
        let hex = Md5Digest.hex_digest(b"abc");
        assert_eq!(hex, "900150983cd24fb0d6963f7d28e17f72");
    }
}
