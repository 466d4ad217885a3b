//! Symbol trees keyed by file path and content hash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tether_types::{ContentHash, LanguageId};

use crate::symbols::SymbolTree;

/// Cached structure for one file.
#[derive(Debug, Clone)]
pub struct SymbolCacheEntry {
    pub language: LanguageId,
    pub hash: ContentHash,
    pub tree: Arc<SymbolTree>,
    pub last_validated: Instant,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(Arc<SymbolTree>),
    Miss,
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// An entry is served only while its hash matches the caller's current
/// on-disk hash; anything else is a miss and drops the entry.
#[derive(Debug)]
pub struct SymbolCache {
    entries: Mutex<HashMap<PathBuf, SymbolCacheEntry>>,
    /// `0` means unbounded.
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SymbolCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, SymbolCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, path: &Path, current: &ContentHash) -> CacheLookup {
        let mut entries = self.entries();
        let stale = match entries.get_mut(path) {
            Some(entry) if entry.valid && entry.hash == *current => {
                entry.last_validated = Instant::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(Arc::clone(&entry.tree));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            entries.remove(path);
            tracing::debug!(path = %path.display(), "Dropped stale symbol cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss
    }

    pub fn store(&self, path: &Path, language: &LanguageId, hash: ContentHash, tree: Arc<SymbolTree>) {
        let mut entries = self.entries();
        if self.max_entries > 0 && !entries.contains_key(path) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_validated)
                .map(|(p, _)| p.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!(path = %oldest.display(), "Evicted symbol cache entry");
            }
        }
        entries.insert(
            path.to_path_buf(),
            SymbolCacheEntry {
                language: language.clone(),
                hash,
                tree,
                last_validated: Instant::now(),
                valid: true,
            },
        );
    }

    /// Mark the entry for `path` stale.
    pub fn invalidate_path(&self, path: &Path) -> bool {
        match self.entries().get_mut(path) {
            Some(entry) if entry.valid => {
                entry.valid = false;
                tracing::debug!(path = %path.display(), "Invalidated symbol cache entry");
                true
            }
            _ => false,
        }
    }

    /// Drop every entry produced by `language`. Returns how many went.
    pub fn invalidate_language(&self, language: &LanguageId) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.language != *language);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(language = %language, removed, "Invalidated symbol cache for language");
        }
        removed
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries().len(),
        }
    }
}
