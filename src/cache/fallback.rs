#![forbid(unsafe_code)]

//! Last-known-good snapshots, one JSON file per key, kept until cleanup.
//!
//! Nothing here reports failure to the caller: a snapshot that cannot be
//! written is simply not there next time, and one that cannot be read is a
//! miss.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use rand_core::{OsRng, RngCore};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::content::{ContentKind, TEMP_SUFFIX, write_json_atomic};

#[derive(Debug, Clone)]
pub struct FallbackStore {
    dir: PathBuf,
}

impl FallbackStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    pub async fn save<T: Serialize>(&self, key: &str, data: &T) {
        let path = self.path_for(key);
        match write_json_atomic(&path, data).await {
            Ok(()) => debug!(key, "saved fallback snapshot"),
            Err(err) => warn!(key, error = %format!("{err:#}"), "could not save fallback snapshot"),
        }
    }

    pub async fn load(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(key, %err, "could not read fallback snapshot");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, %err, "fallback snapshot is not valid JSON");
                None
            }
        }
    }

    pub async fn load_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.load(key).await?;
        serde_json::from_value(value)
            .inspect_err(|err| warn!(key, %err, "fallback snapshot has an unexpected shape"))
            .ok()
    }

    /// Snapshots, and temp files orphaned by interrupted writes, last written
    /// more than `max_age` ago.
    pub async fn stale_files(&self, max_age: Duration) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(dir = %self.dir.display(), %err, "could not list fallback snapshots");
                return Vec::new();
            }
        };

        let now = SystemTime::now();
        let mut stale = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "stopped scanning fallback snapshots");
                    break;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") && !name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(path = %path.display(), %err, "no mtime for fallback snapshot");
                    continue;
                }
            };
            if now.duration_since(modified).unwrap_or_default() > max_age {
                stale.push(path);
            }
        }
        stale
    }

    /// Deletes everything [`FallbackStore::stale_files`] reports. Returns the
    /// number of files removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        for path in self.stale_files(max_age).await {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), %err, "could not remove snapshot"),
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up fallback snapshots");
        }
        removed
    }
}

/// Runs [`FallbackStore::cleanup`] on a random fraction of requests instead of
/// on a timer. `probability` is clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    pub probability: f64,
    pub max_age: Duration,
}

impl CleanupPolicy {
    pub fn new(probability: f64, max_age: Duration) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
            max_age,
        }
    }

    /// Decides from a uniform 32-bit sample whether this request cleans up.
    pub fn should_run(&self, sample: u32) -> bool {
        if self.probability >= 1.0 {
            return true;
        }
        (f64::from(sample) / (f64::from(u32::MAX) + 1.0)) < self.probability
    }

    pub async fn maybe_cleanup(&self, store: &FallbackStore) -> Option<usize> {
        if !self.should_run(OsRng.next_u32()) {
            return None;
        }
        Some(store.cleanup(self.max_age).await)
    }
}

/// Key for a listing snapshot: `{type}_{category}_{region}[_cat{id}]`.
pub fn fallback_key(
    kind: ContentKind,
    category: &str,
    region: &str,
    category_id: Option<&str>,
) -> String {
    let mut key = format!("{}_{}_{}", kind.as_str(), category, region);
    if let Some(category_id) = category_id.filter(|id| !id.is_empty()) {
        key.push_str("_cat");
        key.push_str(category_id);
    }
    sanitize_key(&key)
}

/// Replaces everything outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect()
}
