use parking_lot::RwLock;
use std::collections::HashMap;

use super::CertCache;
use crate::error::Result;

/// Process-local certificate cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CertCache for MemoryCache {
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key))
    }

    fn store(&self, key: &str, value: Vec<u8>) -> Result<Vec<u8>> {
        let mut entries = self.entries.write();
        Ok(entries.entry(key.to_string()).or_insert(value).clone())
    }

    fn replace(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn retrieve_missing_key() {
        let cache = MemoryCache::new();
        assert!(cache.retrieve("example.com").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn store_keeps_first_value() {
        let cache = MemoryCache::new();
        assert_eq!(cache.store("example.com", b"first".to_vec()).unwrap(), b"first");
        assert_eq!(cache.store("example.com", b"second".to_vec()).unwrap(), b"first");
        assert_eq!(cache.retrieve("example.com").unwrap().unwrap(), b"first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_overwrites() {
        let cache = MemoryCache::new();
        cache.store("example.com", b"first".to_vec()).unwrap();
        cache.replace("example.com", b"second".to_vec()).unwrap();
        assert_eq!(cache.get("example.com").unwrap(), b"second");
    }

    #[test]
    fn concurrent_stores_agree_on_one_value() {
        let cache = Arc::new(MemoryCache::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.store("example.com", vec![i]).unwrap())
            })
            .collect();

        let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let stored = cache.get("example.com").unwrap();
        assert!(results.iter().all(|r| *r == stored));
    }
}
