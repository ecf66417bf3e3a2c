//! Stand-in listing served when neither the upstream API, the cache, nor a
//! fallback snapshot can provide anything.

use chrono::{DateTime, Duration, Utc};

use crate::content::{ContentItem, ContentKind, Visibility};

pub const PLACEHOLDER_OWNER: &str = "newtube-placeholder";

/// Builds `count` items with stable ids (`placeholder-{kind}-{n}`), spaced an
/// hour apart going back from `now`, with no engagement.
pub fn placeholder_items(
    kind: ContentKind,
    category: &str,
    region: Option<&str>,
    count: usize,
    now: DateTime<Utc>,
) -> Vec<ContentItem> {
    (0..count)
        .map(|index| ContentItem {
            id: format!("placeholder-{}-{}", kind.as_str(), index + 1),
            kind,
            title: format!("Content temporarily unavailable #{}", index + 1),
            description: String::new(),
            tags: Vec::new(),
            category: category.to_string(),
            region: region.map(str::to_string),
            created_at: now - Duration::hours(index as i64),
            duration_seconds: match kind {
                ContentKind::Video => 600,
                ContentKind::Short => 30,
            },
            owner_id: PLACEHOLDER_OWNER.to_string(),
            view_count: 0,
            like_count: 0,
            dislike_count: 0,
            comment_count: 0,
            visibility: Visibility::Public,
            thumbnail_url: None,
        })
        .collect()
}
