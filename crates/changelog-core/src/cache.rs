use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{ChangelogDocument, DocumentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Zero disables the cache.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(300), capacity: 256 }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    document: ChangelogDocument,
    stored_at: Instant,
}

/// Last-known copy of documents, keyed by path.
///
/// Used as a read fallback when the store is unreachable. Entries expire after
/// `ttl`; once `capacity` is reached the entry stored longest ago is evicted.
#[derive(Debug)]
pub struct ContentCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ContentCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    pub fn put(&self, document: &ChangelogDocument) {
        self.put_at(document, Instant::now());
    }

    pub fn put_at(&self, document: &ChangelogDocument, now: Instant) {
        if self.config.capacity == 0 {
            return;
        }

        let mut entries = self.lock();
        // a document that moved paths must not stay reachable under the old key
        entries.retain(|path, entry| entry.document.id != document.id || *path == document.path);
        entries.retain(|_, entry| !is_expired(entry, now, self.config.ttl));

        if !entries.contains_key(&document.path) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(path, _)| path.clone());
            if let Some(path) = oldest {
                entries.remove(&path);
            }
        }

        entries.insert(
            document.path.clone(),
            CacheEntry { document: document.clone(), stored_at: now },
        );
    }

    #[must_use]
    pub fn get_by_path(&self, path: &str) -> Option<ChangelogDocument> {
        self.get_by_path_at(path, Instant::now())
    }

    #[must_use]
    pub fn get_by_path_at(&self, path: &str, now: Instant) -> Option<ChangelogDocument> {
        let entries = self.lock();
        entries
            .get(path.trim())
            .filter(|entry| !is_expired(entry, now, self.config.ttl))
            .map(|entry| entry.document.clone())
    }

    #[must_use]
    pub fn get_by_id(&self, id: DocumentId) -> Option<ChangelogDocument> {
        self.get_by_id_at(id, Instant::now())
    }

    #[must_use]
    pub fn get_by_id_at(&self, id: DocumentId, now: Instant) -> Option<ChangelogDocument> {
        let entries = self.lock();
        entries
            .values()
            .find(|entry| entry.document.id == id && !is_expired(entry, now, self.config.ttl))
            .map(|entry| entry.document.clone())
    }

    pub fn evict_id(&self, id: DocumentId) {
        self.lock().retain(|_, entry| entry.document.id != id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_expired(entry: &CacheEntry, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(entry.stored_at) > ttl
}
