#![forbid(unsafe_code)]

//! Feed assembly and related-content selection.
//!
//! Callers hand in candidates that already passed their visibility and
//! ownership checks; nothing here looks at `visibility` again.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{
    config::{FeedConfig, FeedPresets, FeedSelection},
    scoring::{ScoringContext, item_score, rank_order, similarity},
};
use crate::content::ContentItem;

pub const DEFAULT_RELATED_LIMIT: usize = 12;

/// Per-request signals that feed into scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedContext {
    pub now: DateTime<Utc>,
    pub user_region: Option<String>,
    pub requesting_user_id: Option<String>,
}

impl FeedContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            user_region: None,
            requesting_user_id: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.user_region = Some(region.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.requesting_user_id = Some(user_id.into());
        self
    }
}

/// A feed entry with the score it earned for this request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
    #[serde(flatten)]
    pub item: ContentItem,
    pub score: f64,
}

/// Resolves `selection` against `presets` and builds the feed.
pub fn build_feed_with(
    candidates: &[ContentItem],
    context: &FeedContext,
    selection: &FeedSelection,
    presets: &FeedPresets,
) -> Vec<RankedItem> {
    let config = presets.resolve(selection);
    build_feed(candidates, context, &config)
}

/// Scores, de-duplicates, diversifies, sorts, and truncates `candidates`.
///
/// Within one owner the k-th best item loses `diversity_penalty * k` before the
/// final sort. The reported `score` is the undiminished item score.
pub fn build_feed(
    candidates: &[ContentItem],
    context: &FeedContext,
    config: &FeedConfig,
) -> Vec<RankedItem> {
    if candidates.is_empty() || config.max_results == 0 {
        return Vec::new();
    }

    let ctx = ScoringContext {
        now: context.now,
        user_region: context.user_region.as_deref(),
        requesting_user_id: context.requesting_user_id.as_deref(),
        weights: config,
    };
    debug!(
        candidates = candidates.len(),
        region = ctx.user_region.unwrap_or(""),
        user = ctx.requesting_user_id.unwrap_or(""),
        "building feed"
    );

    let mut seen = HashSet::new();
    let mut scored: Vec<(&ContentItem, f64)> = Vec::with_capacity(candidates.len());
    for item in candidates {
        if seen.insert(item.id.as_str()) {
            scored.push((item, item_score(item, &ctx)));
        }
    }
    scored.sort_by(|a, b| rank_order(*a, *b));

    let penalty = if config.diversity_penalty.is_finite() {
        config.diversity_penalty.max(0.0)
    } else {
        0.0
    };
    let mut per_owner: HashMap<&str, u32> = HashMap::new();
    let mut adjusted: Vec<(&ContentItem, f64, f64)> = scored
        .into_iter()
        .map(|(item, score)| {
            let seen_from_owner = per_owner.entry(item.owner_id.as_str()).or_insert(0);
            let adjusted = score - penalty * f64::from(*seen_from_owner);
            *seen_from_owner += 1;
            (item, score, adjusted)
        })
        .collect();
    adjusted.sort_by(|a, b| rank_order((a.0, a.2), (b.0, b.2)));

    adjusted
        .into_iter()
        .take(config.max_results)
        .map(|(item, score, _)| RankedItem {
            item: item.clone(),
            score,
        })
        .collect()
}

/// Items most similar to `seed`, never including `seed` itself.
pub fn related_items(seed: &ContentItem, pool: &[ContentItem], limit: usize) -> Vec<ContentItem> {
    let mut seen = HashSet::new();
    seen.insert(seed.id.as_str());
    let mut scored: Vec<(&ContentItem, f64)> = Vec::with_capacity(pool.len());
    for item in pool {
        if seen.insert(item.id.as_str()) {
            scored.push((item, similarity(seed, item)));
        }
    }
    scored.sort_by(|a, b| rank_order(*a, *b));
    scored
        .into_iter()
        .take(limit)
        .map(|(item, _)| item.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::tests::sample_item;
    use chrono::Duration;

    fn item_at(id: &str, created_at: DateTime<Utc>) -> ContentItem {
        let mut item = sample_item(id);
        item.created_at = created_at;
        item
    }

    fn pool(now: DateTime<Utc>, size: usize) -> Vec<ContentItem> {
        (0..size)
            .map(|index| {
                let created_at = now - Duration::hours(index as i64 * 7);
                let mut item = item_at(&format!("item-{index:02}"), created_at);
                item.owner_id = format!("owner-{}", index % 4);
                item.view_count = 100 + index as u64 * 13;
                item.like_count = (index as u64 * 31) % 17;
                item.region = Some(if index % 3 == 0 { "DE" } else { "US" }.into());
                item
            })
            .collect()
    }

    #[test]
    fn empty_pool_gives_empty_feed() {
        let context = FeedContext::at(Utc::now()).with_region("US");
        assert!(build_feed(&[], &context, &FeedConfig::DEFAULT).is_empty());
    }

    #[test]
    fn feed_is_deterministic() {
        let now = Utc::now();
        let candidates = pool(now, 30);
        let context = FeedContext::at(now).with_region("US").with_user("viewer");
        let first = build_feed(&candidates, &context, &FeedConfig::TRENDING);
        let second = build_feed(&candidates, &context, &FeedConfig::TRENDING);
        assert_eq!(first, second);
    }

    #[test]
    fn feed_respects_max_results_and_pool_size() {
        let now = Utc::now();
        let candidates = pool(now, 30);
        let context = FeedContext::at(now);
        let config = FeedConfig {
            max_results: 10,
            ..FeedConfig::DEFAULT
        };
        assert_eq!(build_feed(&candidates, &context, &config).len(), 10);
        let small = &candidates[..4];
        assert_eq!(build_feed(small, &context, &config).len(), 4);
    }

    #[test]
    fn identical_engagement_ranks_newest_first() {
        let now = Utc::now();
        let mut candidates = vec![
            item_at("ten-days", now - Duration::days(10)),
            item_at("today", now),
            item_at("one-day", now - Duration::days(1)),
        ];
        for (index, item) in candidates.iter_mut().enumerate() {
            item.owner_id = format!("owner-{index}");
        }
        let feed = build_feed(&candidates, &FeedContext::at(now), &FeedConfig::DEFAULT);
        let ids: Vec<&str> = feed.iter().map(|ranked| ranked.item.id.as_str()).collect();
        assert_eq!(ids, vec!["today", "one-day", "ten-days"]);
    }

    #[test]
    fn zero_engagement_pool_orders_by_recency() {
        let now = Utc::now();
        let candidates: Vec<ContentItem> = (0..6)
            .map(|index| {
                let mut item = item_at(&format!("z{index}"), now - Duration::hours(index * 5));
                item.view_count = 0;
                item.like_count = 0;
                item.dislike_count = 0;
                item.comment_count = 0;
                item.owner_id = format!("owner-{index}");
                item
            })
            .rev()
            .collect();
        let feed = build_feed(&candidates, &FeedContext::at(now), &FeedConfig::TRENDING);
        let ids: Vec<&str> = feed.iter().map(|ranked| ranked.item.id.as_str()).collect();
        assert_eq!(ids, vec!["z0", "z1", "z2", "z3", "z4", "z5"]);
    }

    #[test]
    fn default_preset_keeps_recency_order_for_one_owner() {
        let now = Utc::now();
        let quiet = |id: &str, hours: i64, owner: &str| {
            let mut item = item_at(id, now - Duration::hours(hours));
            item.view_count = 0;
            item.like_count = 0;
            item.dislike_count = 0;
            item.comment_count = 0;
            item.owner_id = owner.into();
            item
        };
        let candidates = vec![quiet("b1", 2, "B"), quiet("a2", 1, "A"), quiet("a1", 0, "A")];
        let presets = FeedPresets::builtin();
        let feed = build_feed_with(
            &candidates,
            &FeedContext::at(now),
            &FeedSelection::Default,
            &presets,
        );
        let ids: Vec<&str> = feed.iter().map(|ranked| ranked.item.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn duplicates_are_dropped_and_input_untouched() {
        let now = Utc::now();
        let candidates = vec![item_at("a", now), item_at("a", now), item_at("b", now)];
        let snapshot = candidates.clone();
        let feed = build_feed(&candidates, &FeedContext::at(now), &FeedConfig::DEFAULT);
        assert_eq!(feed.len(), 2);
        assert_eq!(candidates, snapshot);
    }

    #[test]
    fn diversity_penalty_demotes_repeat_owners() {
        let now = Utc::now();
        let mut prolific_a = item_at("p1", now);
        prolific_a.owner_id = "prolific".into();
        let mut prolific_b = item_at("p2", now - Duration::minutes(1));
        prolific_b.owner_id = "prolific".into();
        let mut other = item_at("o1", now - Duration::minutes(2));
        other.owner_id = "other".into();
        let candidates = vec![prolific_a, prolific_b, other];
        let context = FeedContext::at(now);

        let flat = FeedConfig {
            diversity_penalty: 0.0,
            ..FeedConfig::LATEST
        };
        let ids: Vec<String> = build_feed(&candidates, &context, &flat)
            .into_iter()
            .map(|ranked| ranked.item.id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2", "o1"]);

        let diverse = FeedConfig {
            diversity_penalty: 0.2,
            ..FeedConfig::LATEST
        };
        let ids: Vec<String> = build_feed(&candidates, &context, &diverse)
            .into_iter()
            .map(|ranked| ranked.item.id)
            .collect();
        assert_eq!(ids, vec!["p1", "o1", "p2"]);
    }

    #[test]
    fn region_match_lifts_local_items() {
        let now = Utc::now();
        let mut local = item_at("local", now - Duration::hours(2));
        local.region = Some("FR".into());
        local.owner_id = "x".into();
        let mut remote = item_at("remote", now - Duration::hours(1));
        remote.region = Some("US".into());
        remote.owner_id = "y".into();
        let candidates = vec![remote, local];

        let context = FeedContext::at(now).with_region("fr");
        let feed = build_feed(&candidates, &context, &FeedConfig::REGIONAL);
        assert_eq!(feed[0].item.id, "local");
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn presets_resolve_through_selection() {
        let now = Utc::now();
        let candidates = pool(now, 80);
        let context = FeedContext::at(now);
        let presets = FeedPresets::builtin();
        let feed = build_feed_with(
            &candidates,
            &context,
            &FeedSelection::Preset("latest".into()),
            &presets,
        );
        assert_eq!(feed.len(), FeedConfig::LATEST.max_results);
        let custom = FeedConfig {
            max_results: 2,
            ..FeedConfig::DEFAULT
        };
        let feed = build_feed_with(&candidates, &context, &FeedSelection::Custom(custom), &presets);
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn ranked_item_serializes_flat() {
        let ranked = RankedItem {
            item: sample_item("a"),
            score: 0.75,
        };
        let value = serde_json::to_value(&ranked).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["score"], 0.75);
        assert_eq!(value["ownerId"], "channel-1");
    }

    #[test]
    fn related_excludes_seed_and_caps() {
        let now = Utc::now();
        let seed = sample_item("seed");
        let mut candidates = pool(now, 20);
        candidates.push(seed.clone());
        let related = related_items(&seed, &candidates, DEFAULT_RELATED_LIMIT);
        assert_eq!(related.len(), DEFAULT_RELATED_LIMIT);
        assert!(related.iter().all(|item| item.id != "seed"));

        let few = related_items(&seed, &candidates[..3], DEFAULT_RELATED_LIMIT);
        assert_eq!(few.len(), 3);
        assert!(related_items(&seed, &[seed.clone()], 12).is_empty());
    }

    #[test]
    fn related_ranks_by_similarity() {
        let now = Utc::now();
        let mut seed = item_at("seed", now);
        seed.tags = vec!["a".into(), "b".into(), "c".into()];
        seed.owner_id = "s".into();

        let mut close = item_at("close", now - Duration::days(30));
        close.tags = vec!["a".into(), "b".into(), "d".into()];
        close.owner_id = "x".into();

        let mut far = item_at("far", now);
        far.tags = vec!["z".into()];
        far.category = "Other".into();
        far.owner_id = "y".into();

        let related = related_items(&seed, &[far, close], 12);
        assert_eq!(related[0].id, "close");
        assert_eq!(related[1].id, "far");
    }
}
