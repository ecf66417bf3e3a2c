#![forbid(unsafe_code)]

//! Axum backend exposing ranked feeds, related content, channel metadata and
//! metric updates.
//!
//! Listing reads never fail in front of the user: when the upstream API is
//! down the feed is built from the TTL cache, the last fallback snapshot, or
//! placeholders, in that order. Only lookups by explicit id answer 404.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use newtube_feed::{
    cache::{
        CacheStore, ChannelCache, CleanupPolicy, ContentCache, FallbackStore, ListingOrigin,
        ListingRequest, ListingResolver,
    },
    channel::ChannelRecord,
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    content::{
        ContentError, ContentItem, ContentKind, Metrics, MetricUpdateRequest, UploadStore,
        Visibility,
    },
    logging,
    ranking::{
        DEFAULT_RELATED_LIMIT, FeedConfig, FeedContext, FeedPresets, FeedSelection, RankedItem,
        build_feed_with, related_items,
    },
    upstream::{UpstreamClient, run_blocking},
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

const MAX_RELATED_LIMIT: usize = 50;

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self {
            data_root: None,
            port: None,
            host: None,
        };
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };
            match flag.as_str() {
                "--data-root" => parsed.data_root = Some(PathBuf::from(value()?)),
                "--port" => parsed.port = Some(parse_port_arg(&value()?)?),
                "--host" => {
                    let host = value()?;
                    parse_host_arg(&host)?;
                    parsed.host = Some(host);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root,
            newtube_port: self.port,
            newtube_host: self.host,
            env_path: None,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port `{value}`"))
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/NEWTUBE_HOST")
}

/// Shared handles behind every route. Everything is cheap to clone.
#[derive(Clone)]
struct AppState {
    uploads: Arc<UploadStore>,
    listings: ListingResolver,
    channels: ChannelCache,
    contents: ContentCache,
    presets: Arc<FeedPresets>,
    upstream: UpstreamClient,
}

impl AppState {
    async fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        let uploads = UploadStore::open(settings.uploads_file())
            .await
            .context("opening upload store")?;
        let presets = FeedPresets::load(&settings.presets_file())?;
        let cache = Arc::new(CacheStore::new(settings.cache_file()));
        let fallback = FallbackStore::new(settings.fallback_dir());
        let cleanup = CleanupPolicy::new(settings.cleanup_probability, settings.fallback_max_age);

        Ok(Self {
            uploads: Arc::new(uploads),
            listings: ListingResolver::new(cache.clone(), fallback, settings.feed_ttl, cleanup),
            channels: ChannelCache::new(cache.clone(), settings.metadata_ttl),
            contents: ContentCache::new(cache, settings.metadata_ttl),
            presets: Arc::new(presets),
            upstream: UpstreamClient::new(
                settings.upstream_url.clone(),
                settings.upstream_key.clone(),
            ),
        })
    }

    /// Looks an item up by id: local uploads first, then the metadata cache
    /// and the upstream API. Private uploads are never served.
    async fn lookup_item(&self, id: &str) -> Option<ContentItem> {
        if let Some(item) = self.uploads.get(id) {
            return (item.visibility != Visibility::Private).then_some(item);
        }
        let upstream = self.upstream.clone();
        self.contents
            .get_or_fetch(id, move |id| run_blocking(move || upstream.video(&id)))
            .await
    }

    async fn assemble_feed(&self, request: FeedRequest) -> ApiResult<FeedResponse> {
        let kind = match request.kind.as_deref() {
            None => ContentKind::Video,
            Some(raw) => ContentKind::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown content kind `{raw}`")))?,
        };
        if let Some(config) = &request.custom_config {
            config
                .validate()
                .map_err(|err| ApiError::bad_request(err.to_string()))?;
        }

        let region = request
            .region
            .as_deref()
            .map(|region| region.trim().to_ascii_uppercase())
            .filter(|region| !region.is_empty());
        let listing_request = ListingRequest {
            kind,
            category: request.category.clone().unwrap_or_default(),
            region: region.clone().unwrap_or_default(),
            category_id: request.category_id.clone(),
        };

        let upstream = self.upstream.clone();
        let live_request = listing_request.clone();
        let listing = self
            .listings
            .resolve(&listing_request, move || async move {
                let raws = run_blocking(move || upstream.popular(&live_request)).await?;
                Ok::<Vec<ContentItem>, anyhow::Error>(
                    raws.into_iter().filter_map(ContentItem::from_raw).collect(),
                )
            })
            .await;

        let mut candidates = self.uploads.public_candidates(Some(kind));
        candidates.extend(
            listing
                .items
                .into_iter()
                .filter(|item| item.visibility == Visibility::Public),
        );

        let mut context = FeedContext::at(Utc::now());
        context.user_region = region;
        context.requesting_user_id = request.user_id.filter(|id| !id.trim().is_empty());

        let selection = FeedSelection::from_parts(request.custom_config, request.preset.as_deref());
        let items = build_feed_with(&candidates, &context, &selection, &self.presets);
        Ok(FeedResponse {
            origin: listing.origin,
            items,
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ContentError> for ApiError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::NotFound(_) => Self::not_found(err.to_string()),
            ContentError::InvalidRequest(_) => Self::bad_request(err.to_string()),
            ContentError::Storage(inner) => {
                error!(error = %format!("{inner:#}"), "upload store write failed");
                Self::internal("could not persist the change")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedRequest {
    kind: Option<String>,
    category: Option<String>,
    category_id: Option<String>,
    #[serde(alias = "userRegion")]
    region: Option<String>,
    user_id: Option<String>,
    preset: Option<String>,
    custom_config: Option<FeedConfig>,
}

#[derive(Debug, Serialize)]
struct FeedResponse {
    origin: ListingOrigin,
    items: Vec<RankedItem>,
}

#[derive(Debug, Deserialize)]
struct RelatedQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChannelsQuery {
    #[serde(default)]
    ids: String,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct DeleteResponse {
    deleted: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresetInfo {
    name: String,
    #[serde(flatten)]
    config: FeedConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;
    let settings = resolve_runtime_settings(args.into_overrides())?;
    logging::init(settings.log_format)?;

    let host = parse_host_arg(&settings.newtube_host)?;
    let state = AppState::from_settings(&settings).await?;
    if !state.upstream.is_configured() {
        warn!(
            "NEWTUBE_UPSTREAM_URL not set; feeds will come from cache, snapshots or placeholders"
        );
    }

    let app = router(state);
    let addr = SocketAddr::new(host, settings.newtube_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, data_root = %settings.data_root.display(), "feed API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/feed", get(get_feed).post(post_feed))
        .route("/api/presets", get(list_presets))
        .route("/api/videos/delete", post(delete_videos))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/videos/{id}/related", get(get_related))
        .route("/api/videos/{id}/metrics", post(update_metrics))
        .route("/api/channels", get(get_channels))
        .route("/api/channels/{id}", get(get_channel))
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler");
    }
}

async fn get_feed(
    State(state): State<AppState>,
    Query(request): Query<FeedRequest>,
) -> ApiResult<Json<FeedResponse>> {
    state.assemble_feed(request).await.map(Json)
}

async fn post_feed(
    State(state): State<AppState>,
    Json(request): Json<FeedRequest>,
) -> ApiResult<Json<FeedResponse>> {
    state.assemble_feed(request).await.map(Json)
}

async fn list_presets(State(state): State<AppState>) -> Json<Vec<PresetInfo>> {
    Json(
        state
            .presets
            .iter()
            .map(|(name, config)| PresetInfo {
                name: name.to_string(),
                config: *config,
            })
            .collect(),
    )
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ContentItem>> {
    state
        .lookup_item(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("video not found"))
}

async fn get_related(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<RelatedQuery>,
) -> ApiResult<Json<Vec<ContentItem>>> {
    let seed = state
        .lookup_item(&id)
        .await
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RELATED_LIMIT)
        .min(MAX_RELATED_LIMIT);

    let mut pool = state.uploads.public_candidates(Some(seed.kind));
    let listing_request =
        ListingRequest::new(seed.kind, "", seed.region.clone().unwrap_or_default());
    if let Some(items) = state.listings.peek(&listing_request).await {
        pool.extend(
            items
                .into_iter()
                .filter(|item| item.visibility == Visibility::Public),
        );
    }

    Ok(Json(related_items(&seed, &pool, limit)))
}

async fn update_metrics(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<MetricUpdateRequest>,
) -> ApiResult<Json<Metrics>> {
    let metrics = state.uploads.apply_metrics(&id, &request).await?;
    Ok(Json(metrics))
}

async fn delete_videos(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = state.uploads.delete_many(&request.ids).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn get_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ChannelRecord>> {
    let upstream = state.upstream.clone();
    state
        .channels
        .get_or_fetch(&id, move |id| run_blocking(move || upstream.channel(&id)))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("channel not found"))
}

async fn get_channels(
    State(state): State<AppState>,
    Query(query): Query<ChannelsQuery>,
) -> ApiResult<Json<Vec<ChannelRecord>>> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(ApiError::bad_request("ids must list at least one channel"));
    }

    let upstream = state.upstream.clone();
    let mut found = state
        .channels
        .batch_fetch(&ids, move |missing| {
            run_blocking(move || upstream.channels(&missing))
        })
        .await;
    // Keep the caller's order; unknown ids are simply absent.
    let mut records = Vec::with_capacity(found.len());
    for id in &ids {
        if let Some(record) = found.remove(id) {
            records.push(record);
        }
    }
    Ok(Json(records))
}
