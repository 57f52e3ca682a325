//! Errors returned by Slack Web API calls

/// A failed Web API call, classified for retry decisions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Connection reset, timeout, DNS failure: worth retrying
    #[error("{method}: network error: {message}")]
    Network { method: String, message: String },

    /// HTTP 429 or `ratelimited`; `retry_after` is in seconds
    #[error("{method}: rate limited (retry after {retry_after}s)")]
    RateLimited { method: String, retry_after: u64 },

    /// Non-success HTTP status other than 429
    #[error("{method}: HTTP {status}")]
    Http { method: String, status: u16 },

    /// The API answered `ok: false`
    #[error("{method}: request failed: {error}")]
    Api { method: String, error: String },

    /// The response body was not what the endpoint documents
    #[error("{method}: failed to decode response: {message}")]
    Decode { method: String, message: String },
}

impl ApiError {
    pub fn api(method: &str, error: impl Into<String>) -> Self {
        ApiError::Api {
            method: method.to_string(),
            error: error.into(),
        }
    }

    pub fn network(method: &str, message: impl Into<String>) -> Self {
        ApiError::Network {
            method: method.to_string(),
            message: message.into(),
        }
    }

    pub fn rate_limited(method: &str, retry_after: u64) -> Self {
        ApiError::RateLimited {
            method: method.to_string(),
            retry_after,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network { .. })
    }

    /// Server-provided backoff hint, for rate-limit errors
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
