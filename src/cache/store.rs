#![forbid(unsafe_code)]

//! TTL cache persisted as a single JSON map (`key -> {timestamp, value}`).
//!
//! Every mutation goes through one FIFO write queue so concurrent `set` calls
//! never interleave their read-modify-write cycles. Inside the queue the
//! writer also holds an exclusive `flock` on `{file}.lock`, which keeps other
//! processes (the maintenance binary) out of the same cycle. Reads skip both
//! and see whichever complete file the last rename left behind.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::content::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    timestamp: i64,
    value: Value,
}

type CacheMap = BTreeMap<String, CacheEntry>;

#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    write_queue: Mutex<()>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_queue: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached value when it is at most `max_age` old. Missing,
    /// expired, and unreadable entries all read as `None`.
    pub async fn get(&self, key: &str, max_age: Duration) -> Option<Value> {
        let map = self.read_map().await;
        let entry = map.get(key)?;
        if !is_fresh(entry.timestamp, max_age, now_ms()) {
            debug!(key, "cache entry expired");
            return None;
        }
        debug!(key, "cache hit");
        Some(entry.value.clone())
    }

    /// Typed [`CacheStore::get`]. A value that no longer matches `T` counts as
    /// a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str, max_age: Duration) -> Option<T> {
        let value = self.get(key, max_age).await?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key, %err, "cached value has an unexpected shape");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.write_entry(key, value, now_ms()).await
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, serde_json::to_value(value)?).await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let _turn = self.write_queue.lock().await;
        let _lock = self.lock_file().await?;
        let mut map = self.read_map().await;
        let removed = map.remove(key).is_some();
        if removed {
            write_json_atomic(&self.path, &map).await?;
        }
        Ok(removed)
    }

    /// Drops every entry older than `max_age`. Returns how many were removed.
    pub async fn prune(&self, max_age: Duration) -> Result<usize> {
        let _turn = self.write_queue.lock().await;
        let _lock = self.lock_file().await?;
        let mut map = self.read_map().await;
        let now = now_ms();
        let before = map.len();
        map.retain(|_, entry| is_fresh(entry.timestamp, max_age, now));
        let removed = before - map.len();
        if removed > 0 {
            write_json_atomic(&self.path, &map).await?;
        }
        Ok(removed)
    }

    /// How many entries [`CacheStore::prune`] would remove right now.
    pub async fn expired_count(&self, max_age: Duration) -> usize {
        let now = now_ms();
        self.read_map()
            .await
            .values()
            .filter(|entry| !is_fresh(entry.timestamp, max_age, now))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.read_map().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn write_entry(&self, key: &str, value: Value, timestamp: i64) -> Result<()> {
        let _turn = self.write_queue.lock().await;
        let _lock = self.lock_file().await?;
        let mut map = self.read_map().await;
        map.insert(key.to_string(), CacheEntry { timestamp, value });
        write_json_atomic(&self.path, &map).await
    }

    #[cfg(test)]
    pub(crate) async fn set_at(&self, key: &str, value: Value, timestamp: i64) -> Result<()> {
        self.write_entry(key, value, timestamp).await
    }

    /// Blocks until this process holds the cross-process write lock. Released
    /// when the guard drops.
    async fn lock_file(&self) -> Result<Flock<std::fs::File>> {
        let lock_path = lock_path_for(&self.path);
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .with_context(|| format!("opening {}", lock_path.display()))?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map_err(|(_, errno)| anyhow!("locking {}: {errno}", lock_path.display()))
        })
        .await
        .context("cache lock task panicked")?
    }

    /// Loads the whole map. A missing file is an empty cache; so is a corrupt
    /// one, which the next write replaces.
    async fn read_map(&self) -> CacheMap {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return CacheMap::new(),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "cache file unreadable");
                return CacheMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    %err,
                    "cache file corrupted, treating as empty"
                );
                CacheMap::new()
            }
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_fresh(timestamp: i64, max_age: Duration, now: i64) -> bool {
    let max_age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(timestamp) <= max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::new(dir.path().join("cache.json"))
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let max_age = Duration::from_millis(1_000);
        assert!(is_fresh(10_000, max_age, 11_000));
        assert!(!is_fresh(10_000, max_age, 11_001));
        assert!(is_fresh(10_000, max_age, 9_000));
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.set("video:abc", json!({ "title": "hi" })).await.unwrap();
        let value = store.get("video:abc", Duration::from_secs(60)).await;
        assert_eq!(value, Some(json!({ "title": "hi" })));
        assert_eq!(store.get("video:zzz", Duration::from_secs(60)).await, None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let an_hour_ago = now_ms() - 60 * 60 * 1_000;
        store.set_at("old", json!(1), an_hour_ago).await.unwrap();
        assert_eq!(store.get("old", Duration::from_secs(60)).await, None);
        assert_eq!(
            store.get("old", Duration::from_secs(2 * 60 * 60)).await,
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn entry_expires_after_waiting() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.set("k", json!("v")).await.unwrap();
        assert!(store.get("k", Duration::from_secs(5)).await.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k", Duration::from_millis(5)).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty_and_reset() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{{{ definitely not json").unwrap();

        assert_eq!(store.get("anything", Duration::from_secs(60)).await, None);
        assert!(store.is_empty().await);

        store.set("fresh", json!(true)).await.unwrap();
        assert_eq!(
            store.get("fresh", Duration::from_secs(60)).await,
            Some(json!(true))
        );
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(serde_json::from_str::<Value>(&raw).is_ok());
    }

    #[tokio::test]
    async fn concurrent_sets_all_land() {
        let dir = tempdir().unwrap();
        let store = Arc::new(store_in(&dir));
        let mut handles = Vec::new();
        for index in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("key:{index}"), json!(index))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len().await, 16);
        for index in 0..16 {
            assert_eq!(
                store.get(&format!("key:{index}"), Duration::from_secs(60)).await,
                Some(json!(index))
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_handles_on_one_file_do_not_lose_writes() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(store_in(&dir));
        let maintenance = Arc::new(store_in(&dir));
        let mut handles = Vec::new();
        for index in 0..40 {
            let backend = backend.clone();
            let maintenance = maintenance.clone();
            handles.push(tokio::spawn(async move {
                backend.set(&format!("feed:{index}"), json!(index)).await
            }));
            handles.push(tokio::spawn(async move {
                maintenance.prune(Duration::from_secs(3_600)).await?;
                if index == 0 {
                    maintenance.set("maintenance:last-run", json!(true)).await?;
                }
                Ok::<(), anyhow::Error>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.len().await, 41);
        assert!(dir.path().join("cache.json.lock").exists());
    }

    #[tokio::test]
    async fn last_write_wins() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.set("k", json!(1)).await.unwrap();
        store.set("k", json!(2)).await.unwrap();
        assert_eq!(store.get("k", Duration::from_secs(60)).await, Some(json!(2)));
    }

    #[tokio::test]
    async fn typed_get_treats_shape_mismatch_as_miss() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.set_as("nums", &vec![1u32, 2, 3]).await.unwrap();
        let nums: Option<Vec<u32>> = store.get_as("nums", Duration::from_secs(60)).await;
        assert_eq!(nums, Some(vec![1, 2, 3]));
        let text: Option<String> = store.get_as("nums", Duration::from_secs(60)).await;
        assert_eq!(text, None);
    }

    #[tokio::test]
    async fn prune_and_remove() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.set_at("stale", json!(0), now_ms() - 10_000).await.unwrap();
        store.set("live", json!(1)).await.unwrap();

        assert_eq!(store.expired_count(Duration::from_secs(5)).await, 1);
        let removed = store.prune(Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.expired_count(Duration::from_secs(5)).await, 0);
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);

        assert!(store.remove("live").await.unwrap());
        assert!(!store.remove("live").await.unwrap());
        assert!(store.is_empty().await);
    }
}
