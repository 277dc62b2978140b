//! In-memory module cache for the active profile.
//!
//! [`ModuleCache`] holds every module of one profile that has been loaded,
//! saved into, or created so far. In split layout a missing module is first
//! looked up on disk; if it is still absent a default (empty object) module
//! is created, so [`ModuleCache::get_or_create`] always yields a module.
//!
//! The cache does no locking of its own. Callers that share it wrap it in
//! the lock that serializes their writes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Layout;
use crate::error::StoreResult;
use crate::fs::FileStore;
use crate::profile::{ProfileData, validate_name};

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking how modules were resolved.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_loads: AtomicU64,
    defaults_created: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_disk_load(&self) {
        self.disk_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_default(&self) {
        self.defaults_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookups answered from memory.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing in memory.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Misses satisfied by reading a module file.
    pub fn disk_loads(&self) -> u64 {
        self.disk_loads.load(Ordering::Relaxed)
    }

    /// Misses satisfied by creating a default module.
    pub fn defaults_created(&self) -> u64 {
        self.defaults_created.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate between 0.0 and 1.0 (0.0 if there were no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.disk_loads.store(0, Ordering::Relaxed);
        self.defaults_created.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} disk_loads={} defaults={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.disk_loads(),
            self.defaults_created(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── module cache ─────────────────────────────────────────────────────

/// Modules of the active profile, keyed by module key.
pub struct ModuleCache {
    store: FileStore,
    profile_id: String,
    modules: ProfileData,
    stats: CacheStats,
}

impl ModuleCache {
    /// An empty cache for `profile_id`.
    pub fn new(store: FileStore, profile_id: impl Into<String>) -> Self {
        Self::from_profile(store, profile_id, ProfileData::new())
    }

    /// A cache seeded with already-loaded profile data.
    pub fn from_profile(store: FileStore, profile_id: impl Into<String>, data: ProfileData) -> Self {
        Self {
            store,
            profile_id: profile_id.into(),
            modules: data,
            stats: CacheStats::default(),
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Point the cache at another profile, keeping the resident modules.
    ///
    /// Subsequent disk lookups and saves use the new id.
    pub fn retarget(&mut self, profile_id: impl Into<String>) {
        self.profile_id = profile_id.into();
    }

    /// Return the module for `key`, loading it from disk (split layout) or
    /// creating an empty one if it is not resident.
    ///
    /// Fails only when `key` is not a usable module key.
    pub async fn get_or_create(&mut self, key: &str) -> StoreResult<Value> {
        validate_name("module key", key)?;

        if let Some(module) = self.modules.get(key) {
            self.stats.record_hit();
            return Ok(module.clone());
        }
        self.stats.record_miss();

        let loaded = match self.store.layout() {
            Layout::Split => self.store.read_module(&self.profile_id, key).await?,
            Layout::SingleFile => None,
        };

        let module = match loaded {
            Some(module) => {
                self.stats.record_disk_load();
                debug!(profile_id = %self.profile_id, module_key = key, "module loaded from disk");
                module
            }
            None => {
                self.stats.record_default();
                debug!(profile_id = %self.profile_id, module_key = key, "created default module");
                Value::Object(Map::new())
            }
        };

        self.modules.insert(key, module.clone());
        Ok(module)
    }

    /// Look up a resident module without loading or creating it.
    pub fn try_get(&self, key: &str) -> Option<&Value> {
        let module = self.modules.get(key);
        match module {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        module
    }

    /// Insert or replace a module.
    pub fn set(&mut self, key: impl Into<String>, module: Value) {
        let key = key.into();
        if let Err(e) = validate_name("module key", &key) {
            warn!(error = %e, "ignoring module with unusable key");
            return;
        }
        self.modules.insert(key, module);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.modules.remove(key)
    }

    /// Every resident module.
    pub fn all(&self) -> &ProfileData {
        &self.modules
    }

    /// Replace every resident module.
    pub fn replace_all(&mut self, data: ProfileData) {
        self.modules = data;
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCache")
            .field("profile_id", &self.profile_id)
            .field("modules", &self.modules.len())
            .field("stats", &format_args!("{}", self.stats))
            .finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaveSettings;
    use crate::fs::Durability;
    use serde_json::json;

    fn store(root: &std::path::Path, layout: Layout) -> FileStore {
        FileStore::new(
            SaveSettings::new(root)
                .with_encryption(false)
                .with_layout(layout),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn absent_module_becomes_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ModuleCache::new(store(dir.path(), Layout::SingleFile), "P");

        let module = cache.get_or_create("Inventory").await.unwrap();
        assert_eq!(module, json!({}));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().defaults_created(), 1);

        cache.get_or_create("Inventory").await.unwrap();
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn split_layout_reads_module_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), Layout::Split);
        store
            .write_module("P", "Stats", &json!({"hp": 50}), Durability::Async)
            .await
            .unwrap();

        let mut cache = ModuleCache::new(store, "P");
        assert_eq!(cache.get_or_create("Stats").await.unwrap(), json!({"hp": 50}));
        assert_eq!(cache.stats().disk_loads(), 1);
        assert_eq!(cache.stats().defaults_created(), 0);
    }

    #[tokio::test]
    async fn set_try_get_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ModuleCache::new(store(dir.path(), Layout::SingleFile), "P");

        assert!(cache.try_get("A").is_none());
        cache.set("A", json!({"x": 1}));
        cache.set("A", json!({"x": 2}));
        cache.set("B", json!([1, 2]));
        cache.set("../bad", json!(null));

        assert_eq!(cache.try_get("A"), Some(&json!({"x": 2})));
        let keys: Vec<&str> = cache.all().keys().collect();
        assert_eq!(keys, vec!["A", "B"]);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ModuleCache::new(store(dir.path(), Layout::Split), "P");
        assert!(cache.get_or_create("a/b").await.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_display_and_reset() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_default();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(stats.to_string().starts_with("hits=2 misses=1 disk_loads=0 defaults=1"));

        stats.reset();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
