//! Certificate authority engine
//!
//! Owns the root bundle and issues host certificates signed by it:
//! - Root CA loaded from, or created once at, a configured path
//! - Host certificates memoized through a write-once [`CertCache`]
//! - Wildcard certificates shared by every subdomain of a reduced domain
//! - Generation serialized per cache key so concurrent requests agree

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use time::OffsetDateTime;

use crate::cache::{CertCache, wildcard_cache_key};
use crate::codec::{self, CertSummary, KeyCertPair};
use crate::config::AuthorityConfig;
use crate::error::{CaError, Result};

/// Serial numbers are 20 random octets, the RFC 5280 maximum
const SERIAL_LEN: usize = 20;

/// How the root bundle was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    /// Generated and written by this authority
    Created,
    /// Read from an existing file
    Loaded,
}

/// Options for [`CertificateAuthority::load_cert`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Issue `*.<domain>` instead of a certificate for the host alone
    pub wildcard: bool,
    /// Use the wildcard-reduced parent of the host as the wildcard domain
    pub wildcard_use_parent: bool,
    /// Skip the cache lookup and replace any stored certificate
    pub overwrite: bool,
    /// Only consult the entry for the host itself, never a parent wildcard
    pub exact_host: bool,
}

impl LoadOptions {
    pub fn wildcard() -> Self {
        Self {
            wildcard: true,
            wildcard_use_parent: true,
            ..Self::default()
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// A host certificate as returned to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCert {
    /// Key the certificate is cached under
    pub cache_key: String,
    pub pair: KeyCertPair,
    /// Whether this call generated and stored the certificate
    pub created: bool,
}

impl IssuedCert {
    pub fn cert_pem(&self) -> &str {
        &self.pair.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.pair.key_pem
    }
}

enum Subject {
    Host(String),
    Wildcard(String),
}

/// One mutex per cache key, dropped from the table once nobody holds it
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn with<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.lock().entry(key.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        // Only the table and this call still reference the lock.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Dynamic certificate authority
pub struct CertificateAuthority {
    root_path: PathBuf,
    root: KeyCertPair,
    common_name: String,
    status: RootStatus,
    config: AuthorityConfig,
    cache: Arc<dyn CertCache>,
    key_locks: KeyLocks,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_path", &self.root_path)
            .field("common_name", &self.common_name)
            .field("status", &self.status)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the root at `root_path`, creating it if the file does not exist.
    ///
    /// An existing root is never overwritten.
    pub fn open(
        root_path: impl Into<PathBuf>,
        config: AuthorityConfig,
        cache: Arc<dyn CertCache>,
    ) -> Result<Self> {
        config.validate()?;
        let root_path = root_path.into();

        if root_path.exists() {
            let root = load_root(&root_path)?;
            return Self::from_root(root_path, root, RootStatus::Loaded, config, cache);
        }

        let root = generate_root(&config)?;
        match persist_root(&root_path, &root, false) {
            Ok(()) => Self::from_root(root_path, root, RootStatus::Created, config, cache),
            // Another process created the root between the check and the write.
            Err(CaError::Conflict(_)) => {
                let root = load_root(&root_path)?;
                Self::from_root(root_path, root, RootStatus::Loaded, config, cache)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a new root at `root_path`.
    ///
    /// Fails with [`CaError::Conflict`] if the file exists, unless `force` is
    /// set, in which case the existing root is replaced.
    pub fn create_root(
        root_path: impl Into<PathBuf>,
        config: AuthorityConfig,
        cache: Arc<dyn CertCache>,
        force: bool,
    ) -> Result<Self> {
        config.validate()?;
        let root_path = root_path.into();

        if root_path.exists() && !force {
            return Err(CaError::Conflict(root_path));
        }

        let root = generate_root(&config)?;
        persist_root(&root_path, &root, force)?;
        Self::from_root(root_path, root, RootStatus::Created, config, cache)
    }

    fn from_root(
        root_path: PathBuf,
        root: KeyCertPair,
        status: RootStatus,
        config: AuthorityConfig,
        cache: Arc<dyn CertCache>,
    ) -> Result<Self> {
        let common_name = root
            .inspect()
            .map_err(|e| CaError::RootLoad(root_path.clone(), e.to_string()))?
            .subject_cn
            .unwrap_or_default();
        let authority = Self {
            root_path,
            root,
            common_name,
            status,
            config,
            cache,
            key_locks: KeyLocks::default(),
        };
        authority
            .issuer()
            .map_err(|e| CaError::RootLoad(authority.root_path.clone(), e.to_string()))?;
        Ok(authority)
    }

    /// Certificate for `host`, reusing a cached wildcard for its parent domain
    pub fn cert_for_host(&self, host: &str) -> Result<IssuedCert> {
        self.load_cert(host, LoadOptions::default())
    }

    /// Wildcard certificate covering `host` and its siblings
    pub fn wildcard_cert_for_host(&self, host: &str) -> Result<IssuedCert> {
        self.load_cert(host, LoadOptions::wildcard())
    }

    /// Look up or issue a certificate for `host`
    pub fn load_cert(&self, host: &str, options: LoadOptions) -> Result<IssuedCert> {
        let host = normalize_host(host)?;
        let wildcard = options.wildcard && host.parse::<IpAddr>().is_err();

        let (cache_key, subject) = if wildcard {
            let domain = if options.wildcard_use_parent {
                wildcard_cache_key(&host).to_string()
            } else {
                host.clone()
            };
            (domain.clone(), Subject::Wildcard(domain))
        } else {
            (host.clone(), Subject::Host(host.clone()))
        };

        if !options.overwrite
            && !options.exact_host
            && !wildcard
            && let Some(issued) = self.cached_parent_wildcard(&host)?
        {
            return Ok(issued);
        }

        self.key_locks.with(&cache_key, || {
            if !options.overwrite
                && let Some(bytes) = self.cache.retrieve(&cache_key)?
            {
                tracing::debug!(host = %host, cache_key = %cache_key, "Certificate cache hit");
                return Ok(IssuedCert {
                    cache_key: cache_key.clone(),
                    pair: codec::decode(&bytes)?,
                    created: false,
                });
            }

            let encoded = self.issue(&subject)?.encode();
            let (held, created) = if options.overwrite {
                self.cache.replace(&cache_key, encoded.clone())?;
                (encoded, true)
            } else {
                let held = self.cache.store(&cache_key, encoded.clone())?;
                let created = held == encoded;
                (held, created)
            };

            Ok(IssuedCert {
                cache_key: cache_key.clone(),
                pair: codec::decode(&held)?,
                created,
            })
        })
    }

    /// A wildcard certificate cached for the parent domain of `host`, if any
    fn cached_parent_wildcard(&self, host: &str) -> Result<Option<IssuedCert>> {
        let parent = wildcard_cache_key(host);
        if parent == host {
            return Ok(None);
        }
        let Some(bytes) = self.cache.retrieve(parent)? else {
            return Ok(None);
        };

        let pair = codec::decode(&bytes)?;
        let pattern = format!("*.{parent}");
        if !pair.inspect()?.dns_names.contains(&pattern) {
            return Ok(None);
        }

        tracing::debug!(host = %host, cache_key = %parent, "Using cached wildcard certificate");
        Ok(Some(IssuedCert {
            cache_key: parent.to_string(),
            pair,
            created: false,
        }))
    }

    fn issue(&self, subject: &Subject) -> Result<KeyCertPair> {
        let (common_name, subject_alt_names) = match subject {
            Subject::Host(host) => (host.clone(), vec![san_for_host(host)?]),
            Subject::Wildcard(domain) => {
                let pattern = format!("*.{domain}");
                let sans = vec![dns_san(&pattern)?, dns_san(domain)?];
                (pattern, sans)
            }
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&common_name, &self.config);
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = subject_alt_names;
        params.serial_number = Some(random_serial()?);

        let (not_before, not_after) = self.config.validity_from(OffsetDateTime::now_utc());
        params.not_before = not_before;
        params.not_after = not_after;

        let issuer = self.issuer()?;
        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &issuer)?;

        tracing::info!(common_name = %common_name, "Issued host certificate");

        Ok(KeyCertPair::new(cert.pem(), key_pair.serialize_pem()))
    }

    /// Signing handle rebuilt from the root bundle
    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.root.key_pem)?;
        Ok(Issuer::from_ca_cert_pem(&self.root.cert_pem, key)?)
    }

    /// PEM of the root certificate, for trust-store installation
    pub fn root_cert_pem(&self) -> &str {
        &self.root.cert_pem
    }

    /// Root certificate and key in bundle form
    pub fn root_bundle_bytes(&self) -> Vec<u8> {
        self.root.encode()
    }

    /// Root certificate and key as a PKCS#12 archive
    pub fn root_archive_bytes(&self, passphrase: &str) -> Result<Vec<u8>> {
        codec::export_archive(&self.root.key_pem, &self.root.cert_pem, passphrase)
    }

    pub fn root_summary(&self) -> Result<CertSummary> {
        self.root.inspect()
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Common name of the root certificate as loaded, which may differ from
    /// the configured one
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn root_status(&self) -> RootStatus {
        self.status
    }
}

fn normalize_host(host: &str) -> Result<String> {
    let trimmed = host.trim().trim_end_matches('.');
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(trimmed);

    if trimmed.is_empty()
        || trimmed.contains(['*', '/', '\\', '\0'])
        || trimmed.contains(char::is_whitespace)
    {
        return Err(CaError::InvalidHostname(host.to_string()));
    }

    match trimmed.parse::<IpAddr>() {
        Ok(_) => Ok(trimmed.to_string()),
        // A port or other separator can never match a DNS SAN.
        Err(_) if trimmed.contains(':') => Err(CaError::InvalidHostname(host.to_string())),
        Err(_) => Ok(trimmed.to_ascii_lowercase()),
    }
}

fn san_for_host(host: &str) -> Result<SanType> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => dns_san(host),
    }
}

fn dns_san(name: &str) -> Result<SanType> {
    Ok(SanType::DnsName(name.try_into().map_err(|_| {
        CaError::InvalidHostname(name.to_string())
    })?))
}

fn distinguished_name(common_name: &str, config: &AuthorityConfig) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(organization) = &config.organization {
        dn.push(DnType::OrganizationName, organization.as_str());
    }
    dn
}

fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; SERIAL_LEN];
    getrandom::fill(&mut bytes)
        .map_err(|e| CaError::Generation(format!("operating system RNG unavailable: {e}")))?;
    // Positive, with a non-zero leading octet.
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    Ok(SerialNumber::from_slice(&bytes))
}

fn generate_root(config: &AuthorityConfig) -> Result<KeyCertPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&config.common_name, config);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial()?);

    let (not_before, not_after) = config.validity_from(OffsetDateTime::now_utc());
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(KeyCertPair::new(cert.pem(), key_pair.serialize_pem()))
}

fn load_root(path: &Path) -> Result<KeyCertPair> {
    let bytes = fs::read(path).map_err(|e| CaError::RootLoad(path.to_path_buf(), e.to_string()))?;
    let root =
        codec::decode(&bytes).map_err(|e| CaError::RootLoad(path.to_path_buf(), e.to_string()))?;

    let summary = root
        .inspect()
        .map_err(|e| CaError::RootLoad(path.to_path_buf(), e.to_string()))?;
    if !summary.is_ca {
        return Err(CaError::RootLoad(
            path.to_path_buf(),
            "certificate is not a CA".to_string(),
        ));
    }

    tracing::debug!(path = %path.display(), "Loaded root certificate");
    Ok(root)
}

/// Write the root bundle atomically, refusing to replace a file unless `force`
fn persist_root(path: &Path, root: &KeyCertPair, force: bool) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| CaError::RootPersist(parent.to_path_buf(), e))?;

    // Temp files are created with 0600, which the root key needs.
    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|e| CaError::RootPersist(path.to_path_buf(), e))?;
    tmp.write_all(&root.encode())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CaError::RootPersist(path.to_path_buf(), e))?;

    let persisted = if force {
        tmp.persist(path).map(|_| ())
    } else {
        tmp.persist_noclobber(path).map(|_| ())
    };
    match persisted {
        Ok(()) => {}
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            return Err(CaError::Conflict(path.to_path_buf()));
        }
        Err(e) => return Err(CaError::RootPersist(path.to_path_buf(), e.error)),
    }

    tracing::info!(path = %path.display(), "Created root certificate");
    Ok(())
}
