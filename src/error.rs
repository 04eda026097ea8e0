use thiserror::Error;

/// Error taxonomy for cache operations.
///
/// Variants carry rendered messages rather than source errors so that a
/// single failure can be delivered to every request attached to a loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Integrity check failed: expected {expected} bytes, found {actual}")]
    Integrity { expected: i64, actual: i64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache not initialized")]
    NotInitialized,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Stable machine-readable code for the failure cause.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Network(_) => "network",
            Self::HttpStatus(_) => "http_status",
            Self::Integrity { .. } => "integrity",
            Self::Cancelled => "cancelled",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config",
            Self::NotInitialized => "not_initialized",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether a fetch attempt that failed with this error may be retried.
    ///
    /// Transport failures always retry; HTTP statuses retry only for 408,
    /// 429 and 5xx. Everything else is terminal for the current attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::HttpStatus(code) => matches!(code, 408 | 429) || (500..=599).contains(code),
            _ => false,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::HttpStatus(status.as_u16())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
