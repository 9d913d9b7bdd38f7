//! Dynamic certificate authority for intercepting TLS proxies.
//!
//! Owns a self-signed root certificate and mints host certificates signed by
//! it on demand:
//! - Root bootstrap: load the root bundle at a path, or create it once
//! - Host and wildcard certificate synthesis with per-key memoization
//! - Pluggable write-once caches (in-memory, file-backed)
//! - PEM bundle and PKCS#12 encoding for interchange

pub mod authority;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;

pub use authority::{CertificateAuthority, IssuedCert, LoadOptions, RootStatus};
pub use cache::{CertCache, FileCache, MemoryCache, sanitize_cache_key, wildcard_cache_key};
pub use codec::KeyCertPair;
pub use config::AuthorityConfig;
pub use error::{CaError, Result};
