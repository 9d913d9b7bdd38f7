use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CertCache, sanitize_cache_key};
use crate::error::{CaError, Result};

/// Certificate cache backed by `<root>/<key>.pem` files.
///
/// Writes go through a temporary file in the same directory that is then
/// linked or renamed into place, so readers never see a partial bundle.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the certificate files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File a cache key maps to
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let stem = sanitize_cache_key(key)?;
        Ok(self.root.join(format!("{stem}.pem")))
    }

    fn write_temp(&self, value: &[u8]) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.root).map_err(|e| CaError::CacheIo(self.root.clone(), e))?;

        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(|e| CaError::CacheIo(self.root.clone(), e))?;
        tmp.write_all(value)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CaError::CacheIo(tmp.path().to_path_buf(), e))?;
        Ok(tmp)
    }
}

impl CertCache for FileCache {
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CaError::CacheIo(path, e)),
        }
    }

    fn store(&self, key: &str, value: Vec<u8>) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        let tmp = self.write_temp(&value)?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(value),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(
                    path = %path.display(),
                    "Certificate file already written by another writer, keeping it"
                );
                fs::read(&path).map_err(|e| CaError::CacheIo(path, e))
            }
            Err(e) => Err(CaError::CacheIo(path, e.error)),
        }
    }

    fn replace(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.write_temp(&value)?;
        tmp.persist(&path)
            .map_err(|e| CaError::CacheIo(path, e.error))?;
        Ok(())
    }
}
