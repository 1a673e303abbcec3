//! Route handlers.
//!
//! Reads consult the bar cache first and fall back to on-demand metrics-only
//! projection; nothing on the read path ever waits on the summary provider.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, AppState};
use crate::models::{Bar, Resolution, Topic, TopicDigest, DEFAULT_RESOLUTION};
use crate::poller::poll_topic_once;

const DEFAULT_BAR_LIMIT: usize = 50;
const DEFAULT_DIGEST_LOOKBACK: usize = 12;

pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "pulsewatch",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------

pub async fn list_topics(State(state): State<AppState>) -> Json<Vec<Topic>> {
    Json(state.registry.list())
}

#[derive(Debug, Deserialize)]
pub struct CreateTopicRequest {
    pub label: String,
    pub query: String,
    pub resolution: Option<String>,
}

pub async fn create_topic(
    State(state): State<AppState>,
    Json(req): Json<CreateTopicRequest>,
) -> Result<(StatusCode, Json<Topic>), ApiError> {
    let resolution = match req.resolution {
        Some(raw) => parse_resolution(&raw)?,
        None => DEFAULT_RESOLUTION,
    };

    let topic = state.registry.add(&req.label, &req.query, resolution)?;
    Ok((StatusCode::CREATED, Json(topic)))
}

pub async fn get_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

pub async fn delete_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state.registry.remove(&id)?;
    state.tick_store.clear(&removed.label);
    state.bar_store.clear(&removed.label);
    info!(%id, label = %removed.label, "topic deleted, stores cleared");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    Ok(Json(state.registry.pause(&id)?))
}

pub async fn resume_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Topic>, ApiError> {
    Ok(Json(state.registry.resume(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateResolutionRequest {
    pub resolution: String,
}

pub async fn update_resolution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateResolutionRequest>,
) -> Result<Json<Topic>, ApiError> {
    let resolution = parse_resolution(&req.resolution)?;
    Ok(Json(state.registry.set_resolution(&id, resolution)?))
}

// ---------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub resolution: Option<String>,
    pub limit: Option<usize>,
    pub with_summaries: Option<bool>,
}

pub async fn get_bars(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<BarsQuery>,
) -> Result<Json<Vec<Bar>>, ApiError> {
    let Some(topic) = state.registry.get(&id) else {
        return Ok(Json(Vec::new()));
    };

    let resolution = match params.resolution {
        Some(raw) => parse_resolution(&raw)?,
        None => topic.resolution,
    };
    let limit = params.limit.unwrap_or(DEFAULT_BAR_LIMIT);
    let with_summaries = params.with_summaries.unwrap_or(true);

    let mut bars = state.bar_store.get(&topic.label, resolution, limit);
    if bars.is_empty() {
        // Cache miss: project metrics-only bars from ticks on the spot.
        // The cache stays the scheduler's responsibility.
        bars = state
            .generator
            .generate_bars(&topic.label, resolution, limit, false, None)
            .await;
    }

    if !with_summaries {
        for bar in &mut bars {
            bar.summary = None;
        }
    }

    Ok(Json(bars))
}

#[derive(Debug, Deserialize)]
pub struct LatestBarQuery {
    pub resolution: Option<String>,
}

pub async fn get_latest_bar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LatestBarQuery>,
) -> Result<Json<Option<Bar>>, ApiError> {
    let Some(topic) = state.registry.get(&id) else {
        return Err(ApiError::NotFound(id));
    };

    let resolution = match params.resolution {
        Some(raw) => parse_resolution(&raw)?,
        None => topic.resolution,
    };

    let latest = match state.bar_store.get_latest(&topic.label, resolution) {
        Some(bar) => Some(bar),
        None => state
            .generator
            .generate_bars(&topic.label, resolution, 1, false, None)
            .await
            .into_iter()
            .next(),
    };

    Ok(Json(latest))
}

// ---------------------------------------------------------------------
// Poll / digest
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub success: bool,
    pub new_ticks: usize,
    pub total_ticks: usize,
}

pub async fn trigger_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    let Some(topic) = state.registry.get(&id) else {
        return Err(ApiError::NotFound(id));
    };

    match poll_topic_once(
        &topic,
        state.search.as_ref(),
        &state.tick_store,
        &state.registry,
    )
    .await
    {
        Ok(outcome) => Ok(Json(PollResponse {
            success: true,
            new_ticks: outcome.new_ticks,
            total_ticks: outcome.total_ticks,
        })),
        Err(_) => Ok(Json(PollResponse {
            success: false,
            new_ticks: 0,
            total_ticks: state.tick_store.count(&topic.label),
        })),
    }
}

#[derive(Debug, Deserialize)]
pub struct DigestQuery {
    pub lookback_bars: Option<usize>,
}

pub async fn create_digest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DigestQuery>,
) -> Result<Json<TopicDigest>, ApiError> {
    let Some(topic) = state.registry.get(&id) else {
        return Err(ApiError::NotFound(id));
    };
    let lookback = params.lookback_bars.unwrap_or(DEFAULT_DIGEST_LOOKBACK);

    let bars = state.bar_store.get(&topic.label, topic.resolution, lookback);
    let digest = state
        .digest_service
        .create_digest(&topic.label, &bars)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    Ok(Json(digest))
}

// ---------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------

pub async fn list_resolutions() -> Json<Value> {
    let resolutions: Vec<Value> = Resolution::ALL
        .iter()
        .map(|res| json!({"resolution": res.as_str(), "seconds": res.seconds()}))
        .collect();
    Json(json!({ "resolutions": resolutions }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let (topics_count, active_topics) = state.registry.counts();
    let mut body = json!({
        "status": "ok",
        "topics_count": topics_count,
        "active_topics": active_topics,
        "time": Utc::now(),
    });
    if let Some(limit) = &state.upstream_limit {
        body["search_rate_limit"] = serde_json::to_value(&*limit.read()).unwrap_or(Value::Null);
    }
    Json(body)
}

fn parse_resolution(raw: &str) -> Result<Resolution, ApiError> {
    raw.parse::<Resolution>()
        .map_err(|_| ApiError::InvalidResolution(raw.to_string()))
}
