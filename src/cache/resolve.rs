#![forbid(unsafe_code)]

//! Listing reads that never fail: fresh cache, then the live upstream, then
//! the last fallback snapshot, then placeholders.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    fallback::{CleanupPolicy, FallbackStore, fallback_key},
    placeholder::placeholder_items,
    store::CacheStore,
};
use crate::content::{ContentItem, ContentKind};

pub const DEFAULT_PLACEHOLDER_COUNT: usize = 12;

/// Where a listing ended up coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingOrigin {
    Cache,
    Live,
    Fallback,
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct Listing {
    pub items: Vec<ContentItem>,
    pub origin: ListingOrigin,
}

/// Shape of a listing request; identical shapes share cache and fallback
/// entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub kind: ContentKind,
    pub category: String,
    pub region: String,
    pub category_id: Option<String>,
}

impl ListingRequest {
    pub fn new(kind: ContentKind, category: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            kind,
            category: category.into(),
            region: region.into(),
            category_id: None,
        }
    }

    /// `"{kind}s:{category}:{region}"`, e.g. `"videos::US"`.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{}s:{}:{}", self.kind.as_str(), self.category, self.region);
        if let Some(category_id) = self.category_id.as_deref() {
            key.push_str(":cat");
            key.push_str(category_id);
        }
        key
    }

    pub fn fallback_key(&self) -> String {
        fallback_key(
            self.kind,
            &self.category,
            &self.region,
            self.category_id.as_deref(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ListingResolver {
    cache: Arc<CacheStore>,
    fallback: FallbackStore,
    ttl: Duration,
    cleanup: CleanupPolicy,
    placeholder_count: usize,
}

impl ListingResolver {
    pub fn new(
        cache: Arc<CacheStore>,
        fallback: FallbackStore,
        ttl: Duration,
        cleanup: CleanupPolicy,
    ) -> Self {
        Self {
            cache,
            fallback,
            ttl,
            cleanup,
            placeholder_count: DEFAULT_PLACEHOLDER_COUNT,
        }
    }

    pub fn with_placeholder_count(mut self, count: usize) -> Self {
        self.placeholder_count = count;
        self
    }

    /// Most recent listing for `request` that does not require `fetch`, if
    /// any: fresh cache first, then the fallback snapshot.
    pub async fn peek(&self, request: &ListingRequest) -> Option<Vec<ContentItem>> {
        if let Some(items) = self.cache.get_as(&request.cache_key(), self.ttl).await {
            return Some(items);
        }
        self.fallback.load_as(&request.fallback_key()).await
    }

    pub async fn resolve<F, Fut>(&self, request: &ListingRequest, fetch: F) -> Listing
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ContentItem>>>,
    {
        let listing = self.resolve_inner(request, fetch).await;
        self.cleanup.maybe_cleanup(&self.fallback).await;
        listing
    }

    async fn resolve_inner<F, Fut>(&self, request: &ListingRequest, fetch: F) -> Listing
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ContentItem>>>,
    {
        let cache_key = request.cache_key();
        if let Some(items) = self
            .cache
            .get_as::<Vec<ContentItem>>(&cache_key, self.ttl)
            .await
        {
            return Listing {
                items,
                origin: ListingOrigin::Cache,
            };
        }

        let fallback_key = request.fallback_key();
        match fetch().await {
            Ok(items) => {
                if let Err(err) = self.cache.set_as(&cache_key, &items).await {
                    warn!(key = %cache_key, error = %format!("{err:#}"), "could not cache listing");
                }
                // An empty answer is not worth keeping as last-known-good.
                if !items.is_empty() {
                    self.fallback.save(&fallback_key, &items).await;
                }
                return Listing {
                    items,
                    origin: ListingOrigin::Live,
                };
            }
            Err(err) => {
                warn!(key = %cache_key, error = %format!("{err:#}"), "live listing fetch failed");
            }
        }

        if let Some(items) = self.fallback.load_as::<Vec<ContentItem>>(&fallback_key).await {
            debug!(key = %fallback_key, "serving fallback snapshot");
            return Listing {
                items,
                origin: ListingOrigin::Fallback,
            };
        }

        debug!(key = %cache_key, "serving placeholder listing");
        let region = Some(request.region.as_str()).filter(|region| !region.is_empty());
        Listing {
            items: placeholder_items(
                request.kind,
                &request.category,
                region,
                self.placeholder_count,
                Utc::now(),
            ),
            origin: ListingOrigin::Placeholder,
        }
    }
}
