use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Config, CronConfig};
use crate::error::Error;
use crate::feed::{self, default_topics, parse_topics};
use crate::fetcher::Fetcher;
use crate::insight::{Insight, InsightRequest, InsightService, NOTHING_FOUND};
use crate::llm::CompletionModel;
use crate::models::Source;
use crate::populate::Populator;
use crate::ratelimit::{client_ip, RateLimiter};
use crate::store::NewsStore;

pub const FOLLOWED_TOPICS_COOKIE: &str = "followedTopics";

const INSIGHT_CACHE_HEADER: HeaderName = HeaderName::from_static("x-insight-cache");

pub struct AppState {
    pub store: Arc<dyn NewsStore>,
    pub fetcher: Arc<Fetcher>,
    pub populator: Arc<Populator>,
    pub insights: InsightService,
    pub insight_limiter: RateLimiter,
    pub sources_limiter: RateLimiter,
    pub cron: CronConfig,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn NewsStore>,
        fetcher: Arc<Fetcher>,
        model: Arc<dyn CompletionModel>,
    ) -> Self {
        let populator = Arc::new(Populator::new(
            fetcher.clone(),
            store.clone(),
            config.populate.clone(),
        ));
        let insights = InsightService::new(
            store.clone(),
            model,
            fetcher.clone(),
            config.insight.clone(),
        );

        Self {
            insight_limiter: RateLimiter::new(store.clone(), "ai-insight", &config.rate_limit),
            sources_limiter: RateLimiter::new(
                store.clone(),
                "ai-insight-sources",
                &config.rate_limit,
            ),
            store,
            fetcher,
            populator,
            insights,
            cron: config.cron.clone(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/news", get(news))
        .route("/api/news/populate", get(populate))
        .route("/api/news/ai-insights", post(ai_insights))
        .route("/api/news/ai-insights/sources", get(insight_sources))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let upstream = self
            .0
            .downcast_ref::<Error>()
            .is_some_and(Error::is_upstream);
        let status = if upstream {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        error!("Request failed: {}", self.0);

        (status, format!("Error: {}", self.0)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

fn rate_limited() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Ratelimited!").into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

// Route handlers
#[derive(Deserialize)]
pub struct NewsQuery {
    #[serde(default)]
    pub categories: Option<String>,
}

pub async fn news(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let topics = resolve_topics(query.categories.as_deref(), &headers);
    let articles = feed::query_feed(state.store.as_ref(), &topics).await?;

    Ok((
        [(header::CACHE_CONTROL, "public, s-maxage=300")],
        Json(articles),
    ))
}

/// Topics for a feed request: explicit parameter, then the follow cookie,
/// then the defaults.
pub fn resolve_topics(categories: Option<&str>, headers: &HeaderMap) -> Vec<String> {
    if let Some(topics) = categories.map(parse_topics).filter(|t| !t.is_empty()) {
        return topics;
    }
    if let Some(topics) = followed_topics(headers).filter(|t| !t.is_empty()) {
        return topics;
    }
    default_topics()
}

/// Decode the `followedTopics` cookie: a URL-encoded JSON array of names.
pub fn followed_topics(headers: &HeaderMap) -> Option<Vec<String>> {
    let prefix = format!("{}=", FOLLOWED_TOPICS_COOKIE);
    let raw = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))?;

    let decoded = url::form_urlencoded::parse(format!("v={}", raw).as_bytes())
        .find(|(k, _)| k == "v")
        .map(|(_, v)| v.into_owned())?;
    let topics: Vec<String> = serde_json::from_str(&decoded).ok()?;

    Some(
        topics
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

pub async fn populate(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !cron_authorized(&state.cron, &headers) {
        return (StatusCode::BAD_REQUEST, "Cron secret doesn't match").into_response();
    }

    let report = state.populator.populate_all().await;
    if report.is_success() {
        return (StatusCode::OK, "Populated news successfully").into_response();
    }

    let failed: Vec<&str> = report.failed.iter().map(|(t, _)| t.as_str()).collect();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to populate topics: {}", failed.join(", ")),
    )
        .into_response()
}

/// An unset or empty secret never matches.
pub fn cron_authorized(cron: &CronConfig, headers: &HeaderMap) -> bool {
    let Some(secret) = cron.secret.as_deref().filter(|s| !s.is_empty()) else {
        return false;
    };
    headers
        .get(cron.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == secret)
}

#[derive(Deserialize)]
pub struct SourcesQuery {
    #[serde(default)]
    pub query: Option<String>,
}

pub async fn insight_sources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourcesQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !state.sources_limiter.check(&client_ip(&headers)).await? {
        return Ok(rate_limited());
    }

    let Some(query) = query.query.filter(|q| !q.trim().is_empty()) else {
        return Ok(bad_request("Query is required"));
    };

    let results = state.fetcher.search_contents(&query).await?;
    let sources: Vec<Source> = results.into_iter().map(Source::from).collect();
    info!("Found {} sources for '{}'", sources.len(), query);

    Ok((
        [(header::CACHE_CONTROL, "public, max-age=86400")],
        Json(json!({ "sources": sources })),
    )
        .into_response())
}

#[derive(Deserialize, Default)]
pub struct InsightBody {
    #[serde(default)]
    pub sources: Option<Vec<Source>>,
}

pub async fn ai_insights(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourcesQuery>,
    headers: HeaderMap,
    body: Option<Json<InsightBody>>,
) -> Result<Response, AppError> {
    if !state.insight_limiter.check(&client_ip(&headers)).await? {
        return Ok(rate_limited());
    }

    let sources = body.and_then(|Json(body)| body.sources);
    let request = match (sources, query.query.filter(|q| !q.trim().is_empty())) {
        (Some(sources), _) => InsightRequest::Sources(sources),
        (None, Some(query)) => InsightRequest::Query(query),
        (None, None) => return Ok(bad_request("Sources or query is required")),
    };

    let cancel = CancellationToken::new();
    let response = match state.insights.generate(request, cancel.clone()).await? {
        Insight::Cached(text) => (
            [(INSIGHT_CACHE_HEADER, "hit")],
            single_event(text),
        )
            .into_response(),
        Insight::NothingFound => single_event(NOTHING_FOUND.to_string()).into_response(),
        Insight::Streaming(deltas) => {
            // Dropping the response body (client disconnect) cancels generation
            let guard = cancel.drop_guard();
            let events = stream::unfold((deltas, guard), |(mut deltas, guard)| async move {
                let delta = deltas.next().await?;
                Some((text_event(&delta), (deltas, guard)))
            });
            Sse::new(events.boxed())
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    };

    Ok(response)
}

fn text_event(text: &str) -> Result<Event, Infallible> {
    Ok(Event::default().data(json!({ "text": text }).to_string()))
}

fn single_event(text: String) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    Sse::new(stream::once(async move { text_event(&text) }).boxed())
}

pub async fn health() -> &'static str {
    "OK"
}
