//! Two-tier caching: a TTL store for recent answers and fallback snapshots
//! for when both the upstream and the TTL store come up empty.

pub mod fallback;
pub mod metadata;
pub mod placeholder;
pub mod resolve;
pub mod store;

pub use fallback::{CleanupPolicy, FallbackStore, fallback_key, sanitize_key};
pub use metadata::{CachedRecord, ChannelCache, ContentCache, MetadataCache};
pub use placeholder::placeholder_items;
pub use resolve::{Listing, ListingOrigin, ListingRequest, ListingResolver};
pub use store::CacheStore;
