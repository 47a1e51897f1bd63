use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a query result from the remote API.
///
/// This error is stored in the [`CacheEntry`](super::CacheEntry) of the failed query and handed
/// out to every observer of that key until the next successful fetch clears it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// The caller lacks the permission to read the requested entity.
    ///
    /// The attached string contains the remote API's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The request failed because of another problem, like connection loss or a 5xx response.
    ///
    /// The attached string contains the remote API's response.
    #[error("request failed: {0}")]
    RequestFailed(String),
    /// The response was received but could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The request was canceled before it settled.
    #[error("request canceled")]
    Canceled,
    /// An unexpected error in the query layer itself.
    #[error("internal error")]
    InternalError,
}

impl TransportError {
    /// Whether repeating the request could plausibly lead to a different outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotFound | Self::PermissionDenied(_) | Self::Canceled | Self::InternalError
        )
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// The tag value used for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::RequestFailed(_) => "requestfailed",
            Self::Malformed(_) => "malformed",
            Self::Canceled => "canceled",
            Self::InternalError => "internal",
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not tell us which of the configured timeouts was hit.
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, err.to_string())
        } else {
            Self::RequestFailed(err.to_string())
        }
    }
}

impl TransportError {
    /// Maps an unsuccessful HTTP status to the matching error.
    pub fn from_status(status: reqwest::StatusCode, details: String) -> Self {
        match status {
            reqwest::StatusCode::NOT_FOUND => Self::NotFound,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Self::PermissionDenied(details)
            }
            _ => Self::RequestFailed(details),
        }
    }
}

/// A pagination operation was called on an accumulator that cannot serve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreconditionError {
    /// The last page carried no continuation cursor.
    #[error("all pages have been fetched")]
    Exhausted,
    /// A continuation fetch for this accumulator is still running.
    #[error("a page fetch is already in flight")]
    InFlight,
    /// The first page has not been fetched yet.
    #[error("the first page has not been fetched")]
    NotStarted,
}

/// The result of a fetch, either the shared data or the reason it could not be fetched.
pub type FetchResult<T> = Result<T, TransportError>;
