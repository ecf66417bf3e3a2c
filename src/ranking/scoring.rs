#![forbid(unsafe_code)]

//! Pure scoring functions. Nothing in here reads the clock or touches shared
//! state; the caller passes `now` in so identical inputs give identical
//! scores.

use std::{cmp::Ordering, collections::HashSet};

use chrono::{DateTime, Utc};

use super::config::FeedConfig;
use crate::content::ContentItem;

/// Region term for items outside the requesting user's region.
pub const REGION_MISMATCH_AFFINITY: f64 = 0.35;
/// Engagement term when nothing is known (no views yet, or no reactions).
pub const NEUTRAL_ENGAGEMENT: f64 = 0.5;
/// A net reaction rate of 10% of views already saturates the engagement term.
const ENGAGEMENT_SCALE: f64 = 10.0;
const COMMENT_WEIGHT: f64 = 2.0;

pub const TAG_SIMILARITY_WEIGHT: f64 = 0.6;
pub const SAME_CATEGORY_BONUS: f64 = 0.25;
pub const SAME_OWNER_BONUS: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub now: DateTime<Utc>,
    pub user_region: Option<&'a str>,
    pub requesting_user_id: Option<&'a str>,
    pub weights: &'a FeedConfig,
}

/// `0.5 ^ (age / half_life)`; future timestamps count as brand new.
pub fn recency_term(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    if !half_life_hours.is_finite() || half_life_hours <= 0.0 {
        return if created_at >= now { 1.0 } else { 0.0 };
    }
    let age_ms = (now - created_at).num_milliseconds().max(0) as f64;
    let age_hours = age_ms / 3_600_000.0;
    0.5_f64.powf(age_hours / half_life_hours)
}

pub fn engagement_term(item: &ContentItem) -> f64 {
    if item.view_count == 0 {
        return NEUTRAL_ENGAGEMENT;
    }
    let net = item.like_count as f64 - item.dislike_count as f64
        + COMMENT_WEIGHT * item.comment_count as f64;
    let ratio = (net / item.view_count as f64 * ENGAGEMENT_SCALE).clamp(-1.0, 1.0);
    (ratio + 1.0) / 2.0
}

pub fn region_term(item_region: Option<&str>, user_region: Option<&str>) -> f64 {
    let Some(user_region) = user_region.map(str::trim).filter(|region| !region.is_empty())
    else {
        return 1.0;
    };
    match item_region {
        Some(region) if region.trim().eq_ignore_ascii_case(user_region) => 1.0,
        _ => REGION_MISMATCH_AFFINITY,
    }
}

fn finite_weight(weight: f64) -> f64 {
    if weight.is_finite() { weight } else { 0.0 }
}

/// Weighted sum of the recency, engagement, and region terms.
pub fn item_score(item: &ContentItem, ctx: &ScoringContext<'_>) -> f64 {
    let weights = ctx.weights;
    let recency = recency_term(item.created_at, ctx.now, weights.recency_half_life_hours);
    let engagement = engagement_term(item);
    let region = region_term(item.region.as_deref(), ctx.user_region);

    let score = finite_weight(weights.recency_weight) * recency
        + finite_weight(weights.engagement_weight) * engagement
        + finite_weight(weights.region_match_weight) * region;
    if score.is_finite() { score } else { 0.0 }
}

/// Feed order: higher score first, then newer, then smaller id.
pub fn rank_order(a: (&ContentItem, f64), b: (&ContentItem, f64)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| b.0.created_at.cmp(&a.0.created_at))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

fn normalized_tags(item: &ContentItem) -> HashSet<String> {
    item.tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Intersection over union of the two tag sets; 0 when both are empty.
pub fn tag_jaccard(a: &ContentItem, b: &ContentItem) -> f64 {
    let left = normalized_tags(a);
    let right = normalized_tags(b);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

pub fn similarity(a: &ContentItem, b: &ContentItem) -> f64 {
    let mut score = TAG_SIMILARITY_WEIGHT * tag_jaccard(a, b);
    if !a.category.is_empty() && a.category.eq_ignore_ascii_case(&b.category) {
        score += SAME_CATEGORY_BONUS;
    }
    if !a.owner_id.is_empty() && a.owner_id == b.owner_id {
        score += SAME_OWNER_BONUS;
    }
    score
}
