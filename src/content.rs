#![forbid(unsafe_code)]

//! Content items (videos and shorts) and the JSON-file store that keeps every
//! local upload.
//!
//! The structs here mirror what is written to `uploads.json` and what the API
//! hands out, so field names are camelCase on the wire.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    Short,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Short => "short",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "videos" => Some(Self::Video),
            "short" | "shorts" => Some(Self::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

/// A single video or short, metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: ContentKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_seconds: u64,
    pub owner_id: String,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub dislike_count: u64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl ContentItem {
    pub fn metrics(&self) -> Metrics {
        Metrics {
            view_count: self.view_count,
            like_count: self.like_count,
            dislike_count: self.dislike_count,
            comment_count: self.comment_count,
        }
    }

    /// Maps a loosely shaped upstream record onto a `ContentItem`. Records
    /// without an id cannot be keyed and are dropped.
    pub fn from_raw(raw: RawVideo) -> Option<Self> {
        let id = raw.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty())?;
        let kind = raw
            .kind
            .as_deref()
            .and_then(ContentKind::parse)
            .unwrap_or(ContentKind::Video);
        let created_at = raw
            .published_at
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
            .map(|value| value.with_timezone(&Utc))
            .unwrap_or_default();

        Some(Self {
            title: raw.title.unwrap_or_else(|| format!("Untitled {}", kind.as_str())),
            kind,
            description: raw.description.unwrap_or_default(),
            tags: raw.tags.unwrap_or_default(),
            category: raw.category.unwrap_or_default(),
            region: raw.region.map(|region| region.trim().to_ascii_uppercase()),
            created_at,
            duration_seconds: raw.duration_seconds.map(Count::value).unwrap_or(0),
            owner_id: raw.channel_id.unwrap_or_default(),
            view_count: raw.view_count.map(Count::value).unwrap_or(0),
            like_count: raw.like_count.map(Count::value).unwrap_or(0),
            dislike_count: raw.dislike_count.map(Count::value).unwrap_or(0),
            comment_count: raw.comment_count.map(Count::value).unwrap_or(0),
            visibility: Visibility::Public,
            thumbnail_url: raw.thumbnail_url,
            id,
        })
    }
}

/// Counter snapshot returned after a metric update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub view_count: u64,
    pub like_count: u64,
    pub dislike_count: u64,
    pub comment_count: u64,
}

/// Video record as the upstream API returns it. Every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVideo {
    pub id: Option<String>,
    #[serde(alias = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    #[serde(alias = "categoryId")]
    pub category: Option<String>,
    pub region: Option<String>,
    pub published_at: Option<String>,
    pub duration_seconds: Option<Count>,
    pub channel_id: Option<String>,
    pub view_count: Option<Count>,
    pub like_count: Option<Count>,
    pub dislike_count: Option<Count>,
    pub comment_count: Option<Count>,
    pub thumbnail_url: Option<String>,
}

/// Upstream counters arrive as JSON numbers or as decimal strings. Anything
/// else (negative, fractional, wrong type) still decodes and counts as 0 or
/// its truncated value, so one bad counter never rejects the record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Count {
    Number(u64),
    Float(f64),
    Text(String),
    Other(Value),
}

impl Count {
    pub fn value(self) -> u64 {
        match self {
            Count::Number(value) => value,
            Count::Float(value) => float_count(value),
            Count::Text(text) => {
                let text = text.trim();
                text.parse()
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().map(float_count))
                    .unwrap_or(0)
            }
            Count::Other(_) => 0,
        }
    }
}

fn float_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.trunc() as u64
    } else {
        0
    }
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    View,
    Like,
    Dislike,
    Comment,
}

/// A validated counter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUpdate {
    Increment(MetricField, u64),
    Decrement(MetricField, u64),
    Set(MetricsPatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsPatch {
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub dislike_count: Option<u64>,
    pub comment_count: Option<u64>,
}

/// Wire shape of a metric update: `{ "action": "...", "value": ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricUpdateRequest {
    pub action: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl MetricUpdate {
    pub fn parse(request: &MetricUpdateRequest) -> Result<Self, ContentError> {
        let action = request.action.trim();
        if action == "setMetrics" {
            let value = request.value.clone().ok_or_else(|| {
                ContentError::InvalidRequest("setMetrics requires a value object".into())
            })?;
            let patch: MetricsPatch = serde_json::from_value(value).map_err(|err| {
                ContentError::InvalidRequest(format!("setMetrics value is malformed: {err}"))
            })?;
            if patch == MetricsPatch::default() {
                return Err(ContentError::InvalidRequest(
                    "setMetrics needs at least one counter".into(),
                ));
            }
            return Ok(Self::Set(patch));
        }

        let (increment, field_name) = if let Some(rest) = action.strip_prefix("increment") {
            (true, rest)
        } else if let Some(rest) = action.strip_prefix("decrement") {
            (false, rest)
        } else {
            return Err(ContentError::InvalidRequest(format!(
                "unknown action `{action}`"
            )));
        };
        let field = match field_name {
            "View" => MetricField::View,
            "Like" => MetricField::Like,
            "Dislike" => MetricField::Dislike,
            "Comment" => MetricField::Comment,
            _ => {
                return Err(ContentError::InvalidRequest(format!(
                    "unknown action `{action}`"
                )));
            }
        };
        let step = match &request.value {
            None | Some(Value::Null) => 1,
            Some(value) => value.as_u64().filter(|step| *step > 0).ok_or_else(|| {
                ContentError::InvalidRequest(format!(
                    "{action} value must be a positive integer"
                ))
            })?,
        };

        Ok(if increment {
            Self::Increment(field, step)
        } else {
            Self::Decrement(field, step)
        })
    }

    fn apply(self, item: &mut ContentItem) {
        match self {
            MetricUpdate::Increment(field, step) => {
                let slot = counter_mut(item, field);
                *slot = slot.saturating_add(step);
            }
            MetricUpdate::Decrement(field, step) => {
                let slot = counter_mut(item, field);
                *slot = slot.saturating_sub(step);
            }
            MetricUpdate::Set(patch) => {
                if let Some(value) = patch.view_count {
                    item.view_count = value;
                }
                if let Some(value) = patch.like_count {
                    item.like_count = value;
                }
                if let Some(value) = patch.dislike_count {
                    item.dislike_count = value;
                }
                if let Some(value) = patch.comment_count {
                    item.comment_count = value;
                }
            }
        }
    }
}

fn counter_mut(item: &mut ContentItem, field: MetricField) -> &mut u64 {
    match field {
        MetricField::View => &mut item.view_count,
        MetricField::Like => &mut item.like_count,
        MetricField::Dislike => &mut item.dislike_count,
        MetricField::Comment => &mut item.comment_count,
    }
}

/// Flat list of uploaded items persisted as one JSON array.
///
/// Reads are served from memory. Mutations run one at a time: the change is
/// applied to a copy, written to disk, and only then swapped in, so a failed
/// write leaves the store untouched.
#[derive(Debug)]
pub struct UploadStore {
    path: PathBuf,
    items: RwLock<Vec<ContentItem>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl UploadStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<ContentItem>>(&bytes)
                .with_context(|| format!("parsing uploads {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading uploads {}", path.display()));
            }
        };
        info!(count = items.len(), path = %path.display(), "loaded uploads");
        Ok(Self {
            path,
            items: RwLock::new(items),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn list(&self) -> Vec<ContentItem> {
        self.items.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ContentItem> {
        self.items.read().iter().find(|item| item.id == id).cloned()
    }

    /// Public items, optionally restricted to one kind. Used to build feed
    /// candidate pools.
    pub fn public_candidates(&self, kind: Option<ContentKind>) -> Vec<ContentItem> {
        self.items
            .read()
            .iter()
            .filter(|item| item.visibility == Visibility::Public)
            .filter(|item| kind.is_none_or(|kind| item.kind == kind))
            .cloned()
            .collect()
    }

    /// Inserts a new item or replaces the one with the same id.
    pub async fn insert(&self, item: ContentItem) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.list();
        match next.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => next.push(item),
        }
        self.commit(next).await
    }

    pub async fn apply_metrics(
        &self,
        id: &str,
        request: &MetricUpdateRequest,
    ) -> Result<Metrics, ContentError> {
        if id.trim().is_empty() {
            return Err(ContentError::InvalidRequest("missing content id".into()));
        }
        let update = MetricUpdate::parse(request)?;

        let _guard = self.write_lock.lock().await;
        let mut next = self.list();
        let item = next
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| ContentError::NotFound(id.to_string()))?;
        update.apply(item);
        let metrics = item.metrics();
        self.commit(next).await?;
        debug!(id, ?update, "applied metric update");
        Ok(metrics)
    }

    /// Removes every item whose id is listed. Returns how many were removed.
    pub async fn delete_many(&self, ids: &[String]) -> Result<usize, ContentError> {
        if ids.is_empty() {
            return Err(ContentError::InvalidRequest("no ids given".into()));
        }
        let _guard = self.write_lock.lock().await;
        let mut next = self.list();
        let before = next.len();
        next.retain(|item| !ids.contains(&item.id));
        let removed = before - next.len();
        if removed > 0 {
            self.commit(next).await?;
        }
        Ok(removed)
    }

    async fn commit(&self, next: Vec<ContentItem>) -> Result<()> {
        write_json_atomic(&self.path, &next).await?;
        *self.items.write() = next;
        Ok(())
    }
}

/// Suffix of in-flight writes; anything left with it was interrupted.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Writes `value` to a uniquely named temp file next to `path` and renames it
/// into place. Concurrent writers never share a temp file.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("creating {}", parent.display()))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        tmp.write_all(&payload)
            .with_context(|| format!("writing {}", tmp.path().display()))?;
        tmp.persist(&path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok::<(), anyhow::Error>(())
    })
    .await
    .context("write task panicked")?
}
