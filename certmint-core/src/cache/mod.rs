//! Certificate caches
//!
//! Handles:
//! - The write-once [`CertCache`] capability the authority memoizes through
//! - An in-memory map scoped to the process
//! - A directory of `<key>.pem` files shared across processes
//! - Cache key derivation for wildcard certificates

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use std::net::IpAddr;

use crate::error::{CaError, Result};

/// Storage for encoded host certificates, keyed by cache key.
///
/// Entries are write-once: `store` never replaces an existing value, so every
/// caller observes the first value written for a key.
pub trait CertCache: Send + Sync {
    /// Look up the bytes stored under `key`
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` unless `key` is already present.
    ///
    /// Returns the bytes held under `key` after the call, which are the
    /// existing value when another writer got there first.
    fn store(&self, key: &str, value: Vec<u8>) -> Result<Vec<u8>>;

    /// Replace the value under `key` unconditionally
    fn replace(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// Cache key under which a wildcard certificate for `host` is stored.
///
/// Drops the leftmost label of hosts with more than two labels, so
/// `sub.example.com` maps to `example.com`. IP literals and hosts with two or
/// fewer labels are returned unchanged.
pub fn wildcard_cache_key(host: &str) -> &str {
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    match host.split_once('.') {
        Some((_, parent)) if parent.contains('.') => parent,
        _ => host,
    }
}

/// Map a cache key to a file stem.
///
/// The wildcard marker `*.` is stripped and dots are preserved. `%` and `:`
/// are percent-escaped so distinct keys never share a file and `host:port` or
/// IPv6 keys stay portable. Keys that could escape the cache directory are
/// rejected.
pub fn sanitize_cache_key(key: &str) -> Result<String> {
    let key = key.strip_prefix("*.").unwrap_or(key);
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
    {
        return Err(CaError::InvalidCacheKey(key.to_string()));
    }

    let mut stem = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => stem.push_str("%25"),
            ':' => stem.push_str("%3A"),
            _ => stem.push(c),
        }
    }
    Ok(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_key_drops_leftmost_label() {
        assert_eq!(wildcard_cache_key("test.example.proxy"), "example.proxy");
        assert_eq!(wildcard_cache_key("a.b.example.com"), "b.example.com");
    }

    #[test]
    fn wildcard_key_keeps_short_hosts() {
        assert_eq!(wildcard_cache_key("example.com"), "example.com");
        assert_eq!(wildcard_cache_key("localhost"), "localhost");
    }

    #[test]
    fn wildcard_key_keeps_ip_literals() {
        assert_eq!(wildcard_cache_key("10.0.0.1"), "10.0.0.1");
        assert_eq!(wildcard_cache_key("::1"), "::1");
        assert_eq!(wildcard_cache_key("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn sanitize_strips_wildcard_marker() {
        assert_eq!(sanitize_cache_key("*.example.com").unwrap(), "example.com");
        assert_eq!(sanitize_cache_key("example.com").unwrap(), "example.com");
    }

    #[test]
    fn sanitize_escapes_port_separator() {
        assert_eq!(sanitize_cache_key("example.com:8443").unwrap(), "example.com%3A8443");
        assert_eq!(sanitize_cache_key("2001:db8::1").unwrap(), "2001%3Adb8%3A%3A1");
    }

    #[test]
    fn sanitize_keeps_distinct_keys_apart() {
        let pairs = [
            ("2001:db8::1", "2001-db8--1"),
            ("example.com:8443", "example.com-8443"),
            ("a:b", "a%3Ab"),
        ];
        for (left, right) in pairs {
            assert_ne!(
                sanitize_cache_key(left).unwrap(),
                sanitize_cache_key(right).unwrap(),
                "{left:?} and {right:?} share a file"
            );
        }
    }

    #[test]
    fn sanitize_rejects_path_escapes() {
        for key in ["", "*.", ".", "..", "../etc/passwd", "a/b", "a\\b", "nul\0byte"] {
            assert!(
                matches!(sanitize_cache_key(key), Err(CaError::InvalidCacheKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }
}
