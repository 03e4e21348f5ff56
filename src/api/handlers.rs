//! Endpoint handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::api::types::{
    validate_feeds, ApiError, FeedFailure, FeedValue, FeedValuesRequest, FeedValuesResponse,
    TimeWindow, VolumeEntry, VolumesRequest, VolumesResponse, WireFeed,
};
use crate::api::ApiState;
use crate::core::domain::FeedId;

/// Window around now inside which volume query bounds must fall.
const TIME_BOUND_SLACK_MS: i64 = 2 * 365 * 24 * 3_600 * 1_000;

pub async fn feed_values(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FeedValuesRequest>,
) -> Result<Json<FeedValuesResponse>, ApiError> {
    let response = resolve_feed_values(&state, &request, None).await?;
    Ok(Json(response))
}

pub async fn feed_values_for_round(
    State(state): State<Arc<ApiState>>,
    Path(voting_round_id): Path<String>,
    Json(request): Json<FeedValuesRequest>,
) -> Result<Json<FeedValuesResponse>, ApiError> {
    if voting_round_id.is_empty() || !voting_round_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::validation("votingRoundId must be a non-negative integer"));
    }
    let round: u64 = voting_round_id
        .parse()
        .map_err(|_| ApiError::validation("votingRoundId out of range"))?;

    // Rounds are fixed-length epochs; a round past the current one does
    // not exist yet.
    let current_round = ((state.clock)() / state.round_duration_ms).max(0) as u64;
    if round > current_round {
        return Err(ApiError::unknown_round(round));
    }

    let response = resolve_feed_values(&state, &request, Some(round)).await?;
    Ok(Json(response))
}

async fn resolve_feed_values(
    state: &ApiState,
    request: &FeedValuesRequest,
    voting_round_id: Option<u64>,
) -> Result<FeedValuesResponse, ApiError> {
    let feeds = validate_feeds(&request.feeds)?;
    let decimals = resolve_decimals(state, &feeds)?;

    let results = state.manager.current_prices(&feeds).await;

    let failures: Vec<FeedFailure> = results
        .iter()
        .filter_map(|(feed, result)| {
            result.as_ref().err().map(|e| FeedFailure {
                feed: feed.to_string(),
                reason: format!("{} ({})", e, e.code()),
            })
        })
        .collect();
    // Any failed feed fails the whole batch; partial data is never
    // returned as a 200.
    if !failures.is_empty() {
        return Err(ApiError::all_feeds_failed(failures));
    }

    let data: Vec<FeedValue> = results
        .into_iter()
        .filter_map(|(feed, result)| result.ok().map(|price| (feed, price)))
        .map(|(feed, price)| {
            let decimals = decimals.get(&feed).copied().unwrap_or(8);
            FeedValue {
                feed_id: WireFeed::from(&feed),
                value: crate::api::types::scale_value(price.price, decimals),
                decimals,
                confidence: price.confidence,
                source: price.sources.join(","),
                timestamp: price.timestamp_ms,
            }
        })
        .collect();

    Ok(FeedValuesResponse { data, timestamp: (state.clock)(), voting_round_id })
}

pub async fn volumes(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<VolumesRequest>,
) -> Result<Json<VolumesResponse>, ApiError> {
    let feeds = validate_feeds(&request.feeds)?;
    let now_ms = (state.clock)();
    if request.start_time >= request.end_time {
        return Err(ApiError::validation("startTime must be before endTime"));
    }
    for bound in [request.start_time, request.end_time] {
        if (now_ms - bound).abs() > TIME_BOUND_SLACK_MS {
            return Err(ApiError::validation("time window bounds must be within two years of now"));
        }
    }
    let decimals = resolve_decimals(&state, &feeds)?;

    let mut data = Vec::with_capacity(feeds.len());
    for feed in &feeds {
        let volume = state
            .manager
            .volume_between(feed, request.start_time, request.end_time)
            .map_err(|_| ApiError::feed_not_found(feed))?;
        data.push(VolumeEntry {
            feed_id: WireFeed::from(feed),
            volume,
            decimals: decimals.get(feed).copied().unwrap_or(8),
        });
    }

    Ok(Json(VolumesResponse {
        data,
        time_window: TimeWindow { start: request.start_time, end: request.end_time },
        timestamp: now_ms,
    }))
}

pub async fn health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    let connection = state.manager.connection_health();
    let (status, code) = if connection.total_sources > 0 && connection.connected_sources == 0 {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if connection.connected_sources < connection.total_sources {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    };
    let body = json!({
        "status": status,
        "timestamp": (state.clock)(),
        "uptime": state.started_at.elapsed().as_secs(),
        "components": {
            "sources": connection,
            "ingest": state.manager.stats(),
        },
    });
    (code, Json(body))
}

pub async fn health_ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    let ready = state.manager.is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({
        "status": if ready { "ready" } else { "not_ready" },
        "timestamp": (state.clock)(),
    })))
}

pub async fn health_live(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "timestamp": (state.clock)(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn metrics_prometheus(State(state): State<Arc<ApiState>>) -> String {
    let connection = state.manager.connection_health();
    state.metrics.set_ingest_stats(&state.manager.stats());
    state.metrics.connected_sources.set(connection.connected_sources as i64);
    state.metrics.total_sources.set(connection.total_sources as i64);
    state.metrics.health_score.set(connection.health_score);
    state.metrics.feeds_tracked.set(state.manager.feeds().len() as i64);
    state.metrics.render()
}

fn resolve_decimals(
    state: &ApiState,
    feeds: &[FeedId],
) -> Result<HashMap<FeedId, u8>, ApiError> {
    feeds
        .iter()
        .map(|feed| {
            state
                .manager
                .catalog_entry(feed)
                .map(|config| (feed.clone(), config.decimals))
                .ok_or_else(|| ApiError::feed_not_found(feed))
        })
        .collect()
}
