#![forbid(unsafe_code)]

//! Channel profile records and their normalization from upstream payloads.

use serde::{Deserialize, Serialize};

use crate::content::Count;

pub const DEFAULT_CHANNEL_THUMBNAIL: &str = "/static/default-channel.png";

/// Canonical channel shape handed to callers. Every field has a concrete
/// value; optional ones are genuinely optional upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner_url: Option<String>,
    pub subscriber_count: u64,
    pub video_count: u64,
    pub view_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Channel as the upstream API reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChannel {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "thumbnail")]
    pub thumbnail_url: Option<String>,
    pub banner_url: Option<String>,
    pub subscriber_count: Option<Count>,
    pub video_count: Option<Count>,
    pub view_count: Option<Count>,
    pub custom_url: Option<String>,
    pub country: Option<String>,
}

impl ChannelRecord {
    pub fn from_raw(raw: RawChannel) -> Option<Self> {
        let id = raw.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty())?;
        Some(Self {
            title: raw
                .title
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| id.clone()),
            description: raw.description.unwrap_or_default(),
            thumbnail_url: raw
                .thumbnail_url
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CHANNEL_THUMBNAIL.to_string()),
            banner_url: raw.banner_url.filter(|url| !url.trim().is_empty()),
            subscriber_count: raw.subscriber_count.map(Count::value).unwrap_or(0),
            video_count: raw.video_count.map(Count::value).unwrap_or(0),
            view_count: raw.view_count.map(Count::value).unwrap_or(0),
            custom_url: raw.custom_url,
            country: raw.country.map(|country| country.trim().to_ascii_uppercase()),
            id,
        })
    }
}
