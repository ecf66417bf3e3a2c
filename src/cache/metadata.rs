#![forbid(unsafe_code)]

//! Long-lived metadata cache for channel and content records, layered on the
//! TTL [`CacheStore`].

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::store::CacheStore;
use crate::{
    channel::{ChannelRecord, RawChannel},
    content::{ContentItem, RawVideo},
};

/// A record that can be cached under `"{KEY_PREFIX}:{id}"` and built from an
/// upstream payload.
pub trait CachedRecord: Serialize + DeserializeOwned + Clone {
    type Raw;
    const KEY_PREFIX: &'static str;

    fn record_id(&self) -> &str;

    /// Fills every missing field with its default. `None` when the payload
    /// cannot be keyed.
    fn normalize(raw: Self::Raw) -> Option<Self>;
}

impl CachedRecord for ChannelRecord {
    type Raw = RawChannel;
    const KEY_PREFIX: &'static str = "channel";

    fn record_id(&self) -> &str {
        &self.id
    }

    fn normalize(raw: RawChannel) -> Option<Self> {
        ChannelRecord::from_raw(raw)
    }
}

impl CachedRecord for ContentItem {
    type Raw = RawVideo;
    const KEY_PREFIX: &'static str = "video";

    fn record_id(&self) -> &str {
        &self.id
    }

    fn normalize(raw: RawVideo) -> Option<Self> {
        ContentItem::from_raw(raw)
    }
}

pub type ChannelCache = MetadataCache<ChannelRecord>;
pub type ContentCache = MetadataCache<ContentItem>;

#[derive(Debug)]
pub struct MetadataCache<R> {
    store: Arc<CacheStore>,
    ttl: Duration,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for MetadataCache<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ttl: self.ttl,
            _record: PhantomData,
        }
    }
}

impl<R: CachedRecord> MetadataCache<R> {
    pub fn new(store: Arc<CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            _record: PhantomData,
        }
    }

    pub fn key(id: &str) -> String {
        format!("{}:{id}", R::KEY_PREFIX)
    }

    pub async fn get_cached(&self, id: &str) -> Option<R> {
        self.store.get_as(&Self::key(id), self.ttl).await
    }

    pub async fn put(&self, record: &R) {
        let key = Self::key(record.record_id());
        if let Err(err) = self.store.set_as(&key, record).await {
            warn!(key = %key, error = %format!("{err:#}"), "could not cache metadata record");
        }
    }

    /// Cached record, or the normalized result of `fetch` which is then
    /// cached. Fetch failures read as `None`; the caller picks the fallback.
    pub async fn get_or_fetch<F, Fut>(&self, id: &str, fetch: F) -> Option<R>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<R::Raw>>>,
    {
        if let Some(cached) = self.get_cached(id).await {
            return Some(cached);
        }

        let raw = match fetch(id.to_string()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(id, kind = R::KEY_PREFIX, "upstream has no such record");
                return None;
            }
            Err(err) => {
                warn!(
                    id,
                    kind = R::KEY_PREFIX,
                    error = %format!("{err:#}"),
                    "metadata fetch failed"
                );
                return None;
            }
        };

        let record = R::normalize(raw)?;
        self.put(&record).await;
        Some(record)
    }

    /// Resolves many ids with at most one upstream call. `fetch` only runs
    /// when something is missing from the cache and receives every missing id
    /// at once.
    pub async fn batch_fetch<F, Fut>(&self, ids: &[String], fetch: F) -> HashMap<String, R>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<R::Raw>>>,
    {
        let mut seen = HashSet::new();
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.get_cached(id).await {
                Some(record) => {
                    found.insert(id.clone(), record);
                }
                None => missing.push(id.clone()),
            }
        }

        if missing.is_empty() {
            return found;
        }

        let requested: HashSet<String> = missing.iter().cloned().collect();
        let raws = match fetch(missing).await {
            Ok(raws) => raws,
            Err(err) => {
                warn!(
                    kind = R::KEY_PREFIX,
                    missing = requested.len(),
                    error = %format!("{err:#}"),
                    "batch metadata fetch failed"
                );
                return found;
            }
        };

        for record in raws.into_iter().filter_map(R::normalize) {
            if !requested.contains(record.record_id()) {
                continue;
            }
            self.put(&record).await;
            found.insert(record.record_id().to_string(), record);
        }
        found
    }
}
