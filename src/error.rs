//! Crate-wide error type and aggregation failure kinds.

use thiserror::Error;

use crate::core::domain::FeedId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Unknown feed: {0}")]
    UnknownFeed(String),

    #[error("Invalid feed name: {0}")]
    InvalidFeed(String),

    #[error("No updates available for {feed}")]
    InsufficientData { feed: FeedId },

    #[error("All updates for {feed} were filtered out")]
    NoValidData { feed: FeedId },

    #[error("{feed} has {got} valid sources, needs {need}")]
    InsufficientSources { feed: FeedId, got: usize, need: usize },

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Machine-readable code for the HTTP boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::WebSocket(_) | Self::Connection(_) => "TRANSPORT_ERROR",
            Self::Json(_) => "PROTOCOL_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Url(_) => "URL_ERROR",
            Self::Subscription(_) => "SUBSCRIPTION_ERROR",
            Self::UnknownFeed(_) => "FEED_NOT_FOUND",
            Self::InvalidFeed(_) => "VALIDATION_ERROR",
            Self::InsufficientData { .. } => "INSUFFICIENT_DATA",
            Self::NoValidData { .. } => "NO_VALID_DATA",
            Self::InsufficientSources { .. } => "INSUFFICIENT_SOURCES",
            Self::Timeout(_) => "TIMEOUT",
        }
    }

    /// True for aggregation failures that should surface as 503 to callers.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::NoValidData { .. } | Self::InsufficientSources { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
