use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::{FetchSource, Gateway, SkipReason};
use crate::reviews::{Reviews, ReviewsClient};
use arc_swap::ArcSwap;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gateway_cache::{CachePolicy, CacheStore};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Reviews client plus the policy requests are served under. Swapped as a
/// unit on config reload.
pub struct ReviewsRoute {
    pub client: ReviewsClient,
    pub policy: CachePolicy,
}

impl ReviewsRoute {
    pub fn build(config: &Config, store: Arc<dyn CacheStore>) -> Result<Self, GatewayError> {
        config.validate()?;
        let gateway = Gateway::new(store, config.gateway_settings())?;
        let client = ReviewsClient::new(gateway, config.endpoint_url()?, config.reviews.validity)?;
        Ok(Self {
            client,
            policy: config.cache_policy()?,
        })
    }
}

/// Shared application state passed to all handlers.
pub struct AppState {
    pub reviews: ArcSwap<ReviewsRoute>,
    pub store: Arc<dyn CacheStore>,
}

impl AppState {
    pub fn new(route: ReviewsRoute, store: Arc<dyn CacheStore>) -> Self {
        Self {
            reviews: ArcSwap::from_pointee(route),
            store,
        }
    }
}

/// Public router: the reviews endpoint the storefront renders from.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/reviews", get(reviews_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Admin router on the metrics port.
pub fn metrics_router(state: Arc<AppState>, prom: PrometheusHandle) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom.clone();
                async move { h.render() }
            }),
        )
        .with_state(state)
}

/// GET /api/reviews
///
/// Never fails: an upstream failure with nothing cached renders as an empty
/// list, the same as a widget with no reviews. Such renders, and renders of a
/// body the validity check refused, are marked `no-store` so no downstream
/// cache holds on to them.
pub async fn reviews_handler(State(state): State<Arc<AppState>>) -> Response {
    let route = state.reviews.load_full();
    // Client disconnects drop this future. Shutdown drains in-flight requests
    // instead of cancelling them.
    let cancel = CancellationToken::new();

    let reviews = match route.client.get_reviews(&route.policy, &cancel).await {
        Ok(reviews) => reviews,
        Err(e) => {
            tracing::error!(
                error = %e,
                endpoint = %route.client.endpoint(),
                "failed to load reviews, rendering empty list"
            );
            Reviews::empty()
        }
    };

    let cache_control = match reviews.source {
        None | Some(FetchSource::NotCached(SkipReason::InvalidPayload)) => {
            CachePolicy::none().header_value()
        }
        Some(_) => route.policy.header_value(),
    };
    let x_cache = reviews.source.map_or("ERROR", |source| source.header_value());

    let list = reviews.reviews();
    let count = list.len();

    let mut response = (
        StatusCode::OK,
        [
            ("x-cache", x_cache.to_string()),
            ("cache-control", cache_control),
        ],
        Json(serde_json::json!({ "reviews": list, "count": count })),
    )
        .into_response();

    // Cached copies carry their age so downstream caches do not restart max-age.
    if matches!(reviews.source, Some(FetchSource::Hit | FetchSource::Stale)) {
        if let Some(age) = reviews.age() {
            response
                .headers_mut()
                .insert(header::AGE, HeaderValue::from(age.as_secs()));
        }
    }

    response
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/stats: store statistics and the active route settings.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let route = state.reviews.load();
    let stats = state.store.stats();

    Json(serde_json::json!({
        "store": state.store.name(),
        "hit_rate": stats.hit_rate(),
        "stats": stats,
        "endpoint": route.client.endpoint(),
        "policy": route.policy.header_value(),
    }))
}
