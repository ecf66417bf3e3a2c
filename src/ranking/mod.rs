//! Content ranking: weight presets, per-item scoring, and feed assembly.

pub mod config;
pub mod feed;
pub mod scoring;

pub use config::{DEFAULT_PRESET, FeedConfig, FeedPresets, FeedSelection};
pub use feed::{
    DEFAULT_RELATED_LIMIT, FeedContext, RankedItem, build_feed, build_feed_with, related_items,
};
pub use scoring::{ScoringContext, item_score, rank_order, similarity};
