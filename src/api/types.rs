//! Wire types and request validation for the feed API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::{is_valid_feed_name, FeedCategory, FeedId};

/// Most feeds a single batched request may name.
pub const MAX_FEEDS_PER_REQUEST: usize = 100;

/// Feed identity as it appears on the wire: integer category + name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFeed {
    pub category: u8,
    pub name: String,
}

impl From<&FeedId> for WireFeed {
    fn from(feed: &FeedId) -> Self {
        Self { category: feed.category.wire(), name: feed.name.clone() }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedValuesRequest {
    pub feeds: Vec<WireFeed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumesRequest {
    pub feeds: Vec<WireFeed>,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedValue {
    pub feed_id: WireFeed,
    /// Consensus price scaled by `10^decimals`.
    pub value: i64,
    pub decimals: u8,
    pub confidence: f64,
    /// Contributing exchanges, comma-joined.
    pub source: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedValuesResponse {
    pub data: Vec<FeedValue>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voting_round_id: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub feed_id: WireFeed,
    pub volume: f64,
    pub decimals: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumesResponse {
    pub data: Vec<VolumeEntry>,
    pub time_window: TimeWindow,
    pub timestamp: i64,
}

/// One feed's failure inside a 503 body.
#[derive(Debug, Serialize)]
pub struct FeedFailure {
    pub feed: String,
    pub reason: String,
}

/// Error shape returned by every endpoint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Vec<FeedFailure>>,
}

impl ApiError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn feed_not_found(feed: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "FEED_NOT_FOUND",
            message: format!("unknown feed {feed}"),
            details: None,
        }
    }

    #[must_use]
    pub fn unknown_round(round: u64) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "UNKNOWN_ROUND",
            message: format!("voting round {round} does not exist yet"),
            details: None,
        }
    }

    #[must_use]
    pub fn all_feeds_failed(details: Vec<FeedFailure>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "ALL_FEEDS_FAILED",
            message: "one or more requested feeds have no data".to_string(),
            details: Some(details),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: bool,
    code: &'static str,
    message: String,
    timestamp: i64,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FeedFailure>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        if self.status.is_server_error() {
            tracing::error!(code = self.code, request_id = %request_id, message = %self.message, "Request failed");
        }
        let body = ErrorBody {
            error: true,
            code: self.code,
            message: self.message,
            timestamp: Utc::now().timestamp_millis(),
            request_id,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Validate the wire feed list and resolve it to [`FeedId`]s.
pub fn validate_feeds(feeds: &[WireFeed]) -> Result<Vec<FeedId>, ApiError> {
    if feeds.is_empty() {
        return Err(ApiError::validation("feeds must be a non-empty array"));
    }
    if feeds.len() > MAX_FEEDS_PER_REQUEST {
        return Err(ApiError::validation(format!(
            "feeds exceeds the limit of {MAX_FEEDS_PER_REQUEST} entries"
        )));
    }
    feeds
        .iter()
        .map(|wire| {
            let category = FeedCategory::from_wire(wire.category).ok_or_else(|| {
                ApiError::validation(format!("category {} outside 1..=4", wire.category))
            })?;
            if !is_valid_feed_name(&wire.name) {
                return Err(ApiError::validation(format!(
                    "feed name {:?} is not of the form BASE/QUOTE",
                    wire.name
                )));
            }
            FeedId::new(category, wire.name.clone())
                .map_err(|e| ApiError::validation(e.to_string()))
        })
        .collect()
}

/// Scale a price into the integer representation the voting system
/// expects.
#[must_use]
pub fn scale_value(price: f64, decimals: u8) -> i64 {
    (price * 10f64.powi(i32::from(decimals))).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(category: u8, name: &str) -> WireFeed {
        WireFeed { category, name: name.to_string() }
    }

    #[test]
    fn test_validate_feeds_happy_path() {
        let feeds = validate_feeds(&[wire(1, "BTC/USD"), wire(2, "EUR/USD")]).unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].category, FeedCategory::Crypto);
        assert_eq!(feeds[1].category, FeedCategory::Forex);
    }

    #[test]
    fn test_validate_feeds_rejects_empty() {
        assert!(validate_feeds(&[]).is_err());
    }

    #[test]
    fn test_validate_feeds_rejects_oversized_batch() {
        let feeds: Vec<WireFeed> = (0..101).map(|_| wire(1, "BTC/USD")).collect();
        assert!(validate_feeds(&feeds).is_err());
    }

    #[test]
    fn test_validate_feeds_rejects_bad_category_and_name() {
        assert!(validate_feeds(&[wire(0, "BTC/USD")]).is_err());
        assert!(validate_feeds(&[wire(5, "BTC/USD")]).is_err());
        assert!(validate_feeds(&[wire(1, "btc/usd")]).is_err());
        assert!(validate_feeds(&[wire(1, "BTCUSD")]).is_err());
    }

    #[test]
    fn test_scale_value() {
        assert_eq!(scale_value(50_000.12345678, 8), 5_000_012_345_678);
        assert_eq!(scale_value(1.5, 2), 150);
        assert_eq!(scale_value(0.015, 2), 2); // rounds half away from zero
    }
}
