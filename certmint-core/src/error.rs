use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during certificate authority operations
#[derive(Debug, Error)]
pub enum CaError {
    #[error("Failed to load root certificate from {0}: {1}")]
    RootLoad(PathBuf, String),

    #[error("Failed to persist root certificate to {0}: {1}")]
    RootPersist(PathBuf, std::io::Error),

    #[error("Failed to decode certificate bundle: {0}")]
    Decode(String),

    #[error("Certificate cache I/O failed for {0}: {1}")]
    CacheIo(PathBuf, std::io::Error),

    #[error("{0} already exists")]
    Conflict(PathBuf),

    #[error("Invalid hostname '{0}'")]
    InvalidHostname(String),

    #[error("Invalid cache key '{0}'")]
    InvalidCacheKey(String),

    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    #[error("Failed to build export archive: {0}")]
    Export(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CaError>;

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Generation(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for CaError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        CaError::Export(e.to_string())
    }
}
