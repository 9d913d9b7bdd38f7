//! Key/certificate bundle encoding
//!
//! A bundle is the certificate PEM followed by the private key PEM. The same
//! format is used for the root file, cache values and per-host files.

use std::net::IpAddr;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::X509;
use pem::{EncodeConfig, LineEnding, Pem};
use rcgen::{KeyPair, PublicKeyData};
use x509_parser::extensions::GeneralName;

use crate::error::{CaError, Result};

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

/// Friendly name for archives whose certificate carries no common name
const DEFAULT_ARCHIVE_NAME: &str = "certmint";

/// A PEM certificate with its PEM private key
#[derive(Clone, PartialEq, Eq)]
pub struct KeyCertPair {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub key_pem: String,
}

impl std::fmt::Debug for KeyCertPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCertPair")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// Fields of a certificate that callers and tests commonly check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertSummary {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Unix timestamp
    pub not_before: i64,
    /// Unix timestamp
    pub not_after: i64,
    pub serial: Vec<u8>,
    pub is_ca: bool,
}

impl KeyCertPair {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Encode as a bundle, certificate first
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.key_pem, &self.cert_pem)
    }

    /// DER bytes of the certificate
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        let block = pem::parse(self.cert_pem.as_bytes())
            .map_err(|e| CaError::Decode(format!("invalid certificate PEM: {e}")))?;
        Ok(block.into_contents())
    }

    pub fn inspect(&self) -> Result<CertSummary> {
        let der = self.cert_der()?;
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| CaError::Decode(format!("invalid certificate: {e}")))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_octets(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let first_cn = |name: &x509_parser::x509::X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
        };

        Ok(CertSummary {
            subject_cn: first_cn(cert.subject()),
            issuer_cn: first_cn(cert.issuer()),
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            serial: cert.raw_serial().to_vec(),
            is_ca: cert.is_ca(),
        })
    }
}

fn ip_from_octets(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

fn to_pem(block: &Pem) -> String {
    pem::encode_config(block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Encode a key and certificate into a single bundle, certificate first
pub fn encode(key_pem: &str, cert_pem: &str) -> Vec<u8> {
    let mut out = String::with_capacity(cert_pem.len() + key_pem.len() + 2);
    out.push_str(cert_pem.trim_end());
    out.push('\n');
    out.push_str(key_pem.trim_end());
    out.push('\n');
    out.into_bytes()
}

/// Decode a bundle produced by [`encode`]
///
/// Both a parseable certificate and a loadable private key must be present.
pub fn decode(bytes: &[u8]) -> Result<KeyCertPair> {
    let blocks =
        pem::parse_many(bytes).map_err(|e| CaError::Decode(format!("malformed PEM: {e}")))?;

    let cert = blocks
        .iter()
        .find(|block| block.tag() == CERTIFICATE_TAG)
        .ok_or_else(|| CaError::Decode("no certificate block found".to_string()))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.contents())
        .map_err(|e| CaError::Decode(format!("invalid certificate: {e}")))?;

    let key = blocks
        .iter()
        .find(|block| block.tag() == PRIVATE_KEY_TAG)
        .ok_or_else(|| CaError::Decode("no private key block found".to_string()))?;
    let key_pem = to_pem(key);
    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| CaError::Decode(format!("invalid private key: {e}")))?;
    if key_pair.subject_public_key_info() != parsed.public_key().raw {
        return Err(CaError::Decode(
            "private key does not match certificate".to_string(),
        ));
    }

    Ok(KeyCertPair {
        cert_pem: to_pem(cert),
        key_pem,
    })
}

/// Build a PKCS#12 archive holding the key and certificate
///
/// An empty passphrase produces an archive that opens without a password.
pub fn export_archive(key_pem: &str, cert_pem: &str, passphrase: &str) -> Result<Vec<u8>> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let pkey = PKey::private_key_from_pem(key_pem.as_bytes())?;

    let friendly_name = KeyCertPair::new(cert_pem, key_pem)
        .inspect()
        .ok()
        .and_then(|summary| summary.subject_cn)
        .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string());

    let mut builder = Pkcs12::builder();
    builder.name(&friendly_name).pkey(&pkey).cert(&cert);
    let archive = builder.build2(passphrase)?;
    Ok(archive.to_der()?)
}
