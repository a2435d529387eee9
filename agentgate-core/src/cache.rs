//! LRU + TTL caching.
//!
//! Four named caches back different endpoint families. Expired entries are
//! invalidated lazily on access and swept by a background task owned by the
//! gateway. Values are stored as JSON so one cache type serves every call
//! site.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use lru::LruCache;
use serde_json::Value;

use crate::config::CacheSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    Rag,
    Ollama,
    Scraper,
    General,
}

impl CacheName {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheName::Rag => "rag",
            CacheName::Ollama => "ollama",
            CacheName::Scraper => "scraper",
            CacheName::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

struct Entry {
    value: Value,
    expires_at: Instant,
    #[allow(dead_code)]
    inserted_at: Instant,
}

/// One strict-LRU cache with per-entry TTL and hit/miss accounting.
pub struct TtlCache {
    default_ttl: Duration,
    capacity: usize,
    entries: Mutex<LruCache<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl TtlCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            default_ttl,
            capacity,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now + ttl,
            inserted_at: now,
        };
        let mut entries = self.entries.lock().unwrap();
        if let Some((evicted_key, _)) = entries.push(key.clone(), entry) {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().unwrap().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        self.expired.fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// The four named caches with their fixed capacities and default TTLs.
pub struct CacheManager {
    enabled: bool,
    rag: TtlCache,
    ollama: TtlCache,
    scraper: TtlCache,
    general: TtlCache,
}

impl CacheManager {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            rag: TtlCache::new(500, Duration::from_secs(600)),
            ollama: TtlCache::new(200, Duration::from_secs(300)),
            scraper: TtlCache::new(100, Duration::from_secs(1800)),
            general: TtlCache::new(300, Duration::from_secs(300)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache(&self, name: CacheName) -> &TtlCache {
        match name {
            CacheName::Rag => &self.rag,
            CacheName::Ollama => &self.ollama,
            CacheName::Scraper => &self.scraper,
            CacheName::General => &self.general,
        }
    }

    pub fn get(&self, name: CacheName, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        self.cache(name).get(key)
    }

    pub fn insert(&self, name: CacheName, key: String, value: Value, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        self.cache(name).insert(key, value, ttl);
    }

    pub fn sweep_all(&self) -> usize {
        [CacheName::Rag, CacheName::Ollama, CacheName::Scraper, CacheName::General]
            .into_iter()
            .map(|name| self.cache(name).sweep())
            .sum()
    }

    pub fn clear_all(&self) {
        self.rag.clear();
        self.ollama.clear();
        self.scraper.clear();
        self.general.clear();
    }

    pub fn stats(&self) -> Vec<(&'static str, CacheStats)> {
        [CacheName::Rag, CacheName::Ollama, CacheName::Scraper, CacheName::General]
            .into_iter()
            .map(|name| (name.as_str(), self.cache(name).stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = TtlCache::new(3, Duration::from_secs(60));
        for i in 0..10 {
            cache.insert(format!("k{i}"), json!(i), None);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn least_recently_used_entry_is_evicted_first() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), json!(1), None);
        cache.insert("b".to_string(), json!(2), None);
        // Touch "a" so "b" becomes the LRU victim.
        assert_eq!(cache.get("a"), Some(json!(1)));
        cache.insert("c".to_string(), json!(3), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn expired_entries_are_invalidated_on_access() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("k".to_string(), json!("v"), Some(Duration::ZERO));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("stale".to_string(), json!(1), Some(Duration::ZERO));
        cache.insert("fresh".to_string(), json!(2), None);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(json!(2)));
    }

    #[test]
    fn reinserting_a_key_does_not_count_as_eviction() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a".to_string(), json!(1), None);
        cache.insert("a".to_string(), json!(2), None);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(json!(2)));
    }

    #[test]
    fn disabled_manager_is_a_no_op() {
        let manager = CacheManager::new(&CacheSettings {
            enabled: false,
            sweep_interval_secs: 60,
        });
        manager.insert(CacheName::General, "k".to_string(), json!(1), None);
        assert_eq!(manager.get(CacheName::General, "k"), None);
    }

    #[test]
    fn named_caches_are_independent() {
        let manager = CacheManager::new(&CacheSettings::default());
        manager.insert(CacheName::Rag, "k".to_string(), json!("rag"), None);
        manager.insert(CacheName::Ollama, "k".to_string(), json!("ollama"), None);
        assert_eq!(manager.get(CacheName::Rag, "k"), Some(json!("rag")));
        assert_eq!(manager.get(CacheName::Ollama, "k"), Some(json!("ollama")));
        assert_eq!(manager.get(CacheName::General, "k"), None);
    }
}
