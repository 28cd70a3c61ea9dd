//! Persistent generation cache.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::key::{CacheKey, model_dir_name};
use super::CachePolicy;
use crate::telemetry;
use crate::types::ModelOutput;
use crate::{EvalError, Result};

/// Environment variable overriding the default cache directory.
pub const CACHE_DIR_ENV: &str = "EVALRUN_CACHE_DIR";

/// Default cache directory: `$EVALRUN_CACHE_DIR`, else
/// `<platform cache dir>/evalrun/generate`.
pub fn default_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("evalrun")
        .join("generate")
}

/// Configuration for a [`CacheStore`].
///
/// ```rust
/// # use evalrun::cache::CacheConfig;
/// let config = CacheConfig::new()
///     .dir("/tmp/evalrun-cache")
///     .max_memory_entries(500);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Storage directory. Default: [`default_cache_dir`].
    pub dir: PathBuf,
    /// Capacity of the in-memory front layer. Default: 1,000.
    pub max_memory_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_memory_entries: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn max_memory_entries(mut self, n: u64) -> Self {
        self.max_memory_entries = n;
        self
    }
}

/// One stored generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key digest.
    pub key: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
    #[serde(default)]
    pub scopes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// `None` = never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub output: ModelOutput,
}

impl CacheEntry {
    /// An entry is expired from its expiry instant onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::from_parts(&self.model, self.base_url.clone(), self.epoch, &self.key)
    }
}

/// Listing row returned by [`CacheStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub epoch: Option<u32>,
    pub scopes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// Selects entries for [`CacheStore::list`], [`CacheStore::prune`] and
/// [`CacheStore::clear`]. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFilter {
    /// Only entries for this model.
    pub model: Option<String>,
    /// Only entries carrying every one of these scope labels.
    pub scopes: BTreeMap<String, String>,
    /// Only expired entries.
    pub expired_only: bool,
}

impl CacheFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn scope(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.scopes.insert(name.into(), value.into());
        self
    }

    pub fn expired_only(mut self) -> Self {
        self.expired_only = true;
        self
    }

    fn matches(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        if self.model.as_ref().is_some_and(|m| *m != entry.model) {
            return false;
        }
        if self.expired_only && !entry.is_expired_at(now) {
            return false;
        }
        self.scopes
            .iter()
            .all(|(name, value)| entry.scopes.get(name) == Some(value))
    }
}

/// Per-key write serialization. Locks are created on demand and dropped once
/// nobody holds them.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn acquire(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &CacheKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

/// Content-addressed store of generation outputs.
///
/// Entries live at `<dir>/<model>/<digest>.json` and survive restarts. A
/// bounded moka cache in front serves hot entries and is kept coherent on
/// every put, prune and clear. Shared across samples via `Arc`.
///
/// Lookups degrade to a miss on any storage failure and writes that fail are
/// logged and skipped; a broken cache never fails a sample. The management
/// operations (`list`, `prune`, `clear`) do return errors.
pub struct CacheStore {
    dir: PathBuf,
    memory: Cache<CacheKey, Arc<CacheEntry>>,
    locks: KeyLocks,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field("memory_entries", &self.memory.entry_count())
            .finish()
    }
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.max_memory_entries)
            .build();
        Self {
            dir: config.dir.clone(),
            memory,
            locks: KeyLocks::default(),
        }
    }

    /// Store rooted at `dir` with default settings otherwise.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(&CacheConfig::new().dir(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir
            .join(model_dir_name(key.model()))
            .join(format!("{}.json", key.digest()))
    }

    /// Look up an unexpired entry.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.get_at(key, Utc::now()).await
    }

    /// [`get`](Self::get) against an explicit clock.
    pub async fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        let (entry, from_disk) = match self.memory.get(key).await {
            Some(entry) => (Some(entry), false),
            None => (self.read_entry(key).await, true),
        };

        match entry {
            Some(entry) if !entry.is_expired_at(now) => {
                if from_disk {
                    self.memory.insert(key.clone(), entry.clone()).await;
                }
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "model" => key.model().to_string())
                    .increment(1);
                debug!(key = %key, model = key.model(), "cache hit");
                Some(entry)
            }
            Some(_) => {
                // Stays on disk until pruned.
                self.memory.invalidate(key).await;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "model" => key.model().to_string())
                    .increment(1);
                debug!(key = %key, model = key.model(), "cache entry expired");
                None
            }
            None => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "model" => key.model().to_string())
                    .increment(1);
                None
            }
        }
    }

    async fn read_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                storage_error("get", &path, &e);
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == key.digest() => Some(Arc::new(entry)),
            Ok(_) => {
                storage_error("get", &path, &"digest does not match file name");
                None
            }
            Err(e) => {
                storage_error("get", &path, &e);
                None
            }
        }
    }

    /// Store a generation output. Last write wins.
    pub async fn put(&self, key: &CacheKey, output: ModelOutput, policy: &CachePolicy) {
        self.put_at(key, output, policy, Utc::now()).await
    }

    /// [`put`](Self::put) against an explicit clock.
    pub async fn put_at(
        &self,
        key: &CacheKey,
        output: ModelOutput,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) {
        // Expiries too large to represent never expire.
        let expires_at = policy.expiry.and_then(|ttl| {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
        });
        let entry = CacheEntry {
            key: key.digest().to_string(),
            model: key.model().to_string(),
            base_url: key.base_url().map(str::to_string),
            epoch: key.epoch(),
            scopes: policy.scopes.clone(),
            created_at: now,
            expires_at,
            output,
        };

        let lock = self.locks.acquire(key);
        {
            let _guard = lock.lock().await;
            let path = self.entry_path(key);
            match write_entry(&path, &entry).await {
                Ok(()) => {
                    self.memory.insert(key.clone(), Arc::new(entry)).await;
                    debug!(key = %key, model = key.model(), "cached generation");
                }
                Err(e) => {
                    self.memory.invalidate(key).await;
                    storage_error("put", &path, &e);
                }
            }
        }
        self.locks.release(key, lock);
    }

    /// Entries matching `filter`, sorted by model then creation time.
    pub async fn list(&self, filter: &CacheFilter) -> Result<Vec<CacheEntryInfo>> {
        let now = Utc::now();
        let mut rows: Vec<CacheEntryInfo> = self
            .scan(filter, now)
            .await?
            .into_iter()
            .map(|found| CacheEntryInfo {
                expired: found.entry.is_expired_at(now),
                key: found.entry.key,
                model: found.entry.model,
                base_url: found.entry.base_url,
                epoch: found.entry.epoch,
                scopes: found.entry.scopes,
                created_at: found.entry.created_at,
                expires_at: found.entry.expires_at,
                size_bytes: found.size_bytes,
                path: found.path,
            })
            .collect();
        rows.sort_by(|a, b| {
            a.model
                .cmp(&b.model)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.key.cmp(&b.key))
        });
        Ok(rows)
    }

    /// Remove expired entries matching `filter`. Returns how many were removed.
    pub async fn prune(&self, filter: &CacheFilter) -> Result<usize> {
        self.prune_at(filter, Utc::now()).await
    }

    /// [`prune`](Self::prune) against an explicit clock.
    pub async fn prune_at(&self, filter: &CacheFilter, now: DateTime<Utc>) -> Result<usize> {
        let filter = CacheFilter {
            expired_only: true,
            ..filter.clone()
        };
        let mut removed = 0;
        for found in self.scan(&filter, now).await? {
            let key = found.entry.cache_key();
            let lock = self.locks.acquire(&key);
            let result = {
                let _guard = lock.lock().await;
                // A concurrent put may have refreshed the entry since the scan.
                match read_file_entry(&found.path).await {
                    Ok(Some((current, _))) if current.is_expired_at(now) => {
                        self.remove(&key, &found.path).await
                    }
                    Ok(_) => Ok(false),
                    Err(e) => Err(e),
                }
            };
            self.locks.release(&key, lock);
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => storage_error("prune", &found.path, &e),
            }
        }
        debug!(removed, dir = %self.dir.display(), "pruned expired cache entries");
        Ok(removed)
    }

    /// Remove every entry matching `filter`, expired or not. Returns how many
    /// were removed.
    pub async fn clear(&self, filter: &CacheFilter) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for found in self.scan(filter, now).await? {
            let key = found.entry.cache_key();
            let lock = self.locks.acquire(&key);
            let result = {
                let _guard = lock.lock().await;
                self.remove(&key, &found.path).await
            };
            self.locks.release(&key, lock);
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => storage_error("clear", &found.path, &e),
            }
        }
        if *filter == CacheFilter::default() {
            self.memory.invalidate_all();
        }
        debug!(removed, dir = %self.dir.display(), "cleared cache entries");
        Ok(removed)
    }

    /// Remove one entry file. `Ok(false)` when it was already gone.
    async fn remove(&self, key: &CacheKey, path: &Path) -> io::Result<bool> {
        self.memory.invalidate(key).await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn scan(&self, filter: &CacheFilter, now: DateTime<Utc>) -> Result<Vec<FoundEntry>> {
        let mut found = Vec::new();
        let model_dirs = match &filter.model {
            Some(model) => vec![self.dir.join(model_dir_name(model))],
            None => match list_dir(&self.dir).await {
                Ok(paths) => paths,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
                Err(e) => return Err(dir_error(&self.dir, e)),
            },
        };

        for model_dir in model_dirs {
            if !tokio::fs::metadata(&model_dir)
                .await
                .is_ok_and(|m| m.is_dir())
            {
                continue;
            }
            let files = list_dir(&model_dir)
                .await
                .map_err(|e| dir_error(&model_dir, e))?;
            for path in files {
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match read_file_entry(&path).await {
                    Ok(Some((entry, size_bytes))) => {
                        if filter.matches(&entry, now) {
                            found.push(FoundEntry {
                                entry,
                                size_bytes,
                                path,
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => storage_error("list", &path, &e),
                }
            }
        }
        Ok(found)
    }
}

struct FoundEntry {
    entry: CacheEntry,
    size_bytes: u64,
    path: PathBuf,
}

async fn list_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Read and parse one entry file. `Ok(None)` when it vanished.
async fn read_file_entry(path: &Path) -> io::Result<Option<(CacheEntry, u64)>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let entry = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some((entry, bytes.len() as u64)))
}

/// Write to a temporary file first, then rename into place.
async fn write_entry(path: &Path, entry: &CacheEntry) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(entry).map_err(io::Error::other)?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    tokio::fs::write(&tmp_path, &json).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

fn storage_error(operation: &'static str, path: &Path, error: &dyn std::fmt::Display) {
    metrics::counter!(telemetry::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
    warn!(operation, path = %path.display(), error = %error, "cache storage error");
}

fn dir_error(dir: &Path, e: io::Error) -> EvalError {
    EvalError::Cache(format!("failed to read cache dir {}: {e}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerateConfig, GenerateRequest, Message};

    fn key(text: &str) -> CacheKey {
        let messages = vec![Message::user(text)];
        let config = GenerateConfig::new();
        CacheKey::compute(
            "test/model",
            None,
            &GenerateRequest::new(&messages, &config),
            0,
            &CachePolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn filter_requires_every_scope() {
        let entry = CacheEntry {
            key: "k".into(),
            model: "m".into(),
            base_url: None,
            epoch: None,
            scopes: BTreeMap::from([("role".into(), "grader".into())]),
            created_at: Utc::now(),
            expires_at: None,
            output: ModelOutput::text("m", "x"),
        };
        let now = Utc::now();
        assert!(CacheFilter::new().matches(&entry, now));
        assert!(CacheFilter::new().scope("role", "grader").matches(&entry, now));
        assert!(!CacheFilter::new().scope("role", "solver").matches(&entry, now));
        assert!(
            !CacheFilter::new()
                .scope("role", "grader")
                .scope("team", "a")
                .matches(&entry, now)
        );
        assert!(!CacheFilter::new().model("other").matches(&entry, now));
        assert!(!CacheFilter::new().expired_only().matches(&entry, now));
    }

    #[tokio::test]
    async fn entries_land_under_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        let key = key("hello");
        store
            .put(&key, ModelOutput::text("test/model", "hi"), &CachePolicy::default())
            .await;

        let path = dir
            .path()
            .join("test_model")
            .join(format!("{}.json", key.digest()));
        assert!(path.exists());
        // No temp files left behind.
        let leftovers = std::fs::read_dir(dir.path().join("test_model"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let key = key("hello");
        let model_dir = dir.path().join("test_model");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join(format!("{}.json", key.digest())), b"{not json").unwrap();

        let store = CacheStore::open(dir.path());
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn key_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        let key = key("hello");
        store
            .put(&key, ModelOutput::text("test/model", "hi"), &CachePolicy::default())
            .await;
        assert!(store.locks.locks.lock().unwrap().is_empty());
    }
}
