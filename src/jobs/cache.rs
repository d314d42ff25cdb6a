//! Small LRU cache of processed cover thumbnails
//!
//! Many items share the same placeholder or profile artwork. The cache maps a
//! remote URL to the inline data URL produced for it, and is consulted before
//! any cover sub-fetch is issued.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl Entries {
    fn touch(&mut self, url: &str) {
        if let Some(pos) = self.order.iter().position(|u| u == url)
            && let Some(key) = self.order.remove(pos)
        {
            self.order.push_back(key);
        }
    }
}

/// URL to data-URL cache with least-recently-used eviction
#[derive(Debug)]
pub struct CoverCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl CoverCache {
    /// Create a cache holding at most `capacity` entries (zero disables caching)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a processed cover, marking it recently used
    pub fn get(&self, url: &str) -> Option<String> {
        let mut entries = self.lock();
        let hit = entries.map.get(url).cloned();
        if hit.is_some() {
            entries.touch(url);
        }
        hit
    }

    /// Store a processed cover, evicting the least recently used entry if full
    pub fn insert(&self, url: impl Into<String>, data_url: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }

        let url = url.into();
        let mut entries = self.lock();

        if entries.map.insert(url.clone(), data_url.into()).is_some() {
            entries.touch(&url);
            return;
        }

        entries.order.push_back(url);
        while entries.order.len() > self.capacity {
            if let Some(evicted) = entries.order.pop_front() {
                entries.map.remove(&evicted);
            }
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CoverCache {
    fn default() -> Self {
        Self::new(64)
    }
}
