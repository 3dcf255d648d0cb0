use thiserror::Error;

/// Failures surfaced by the gateway.
///
/// `Clone` so that callers coalesced onto one in-flight fetch can all receive
/// the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Required setting missing or unusable. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network error, timeout or non-2xx response.
    #[error("fetch from {url} failed{}: {reason}", status_suffix(.status))]
    FetchFailure {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    /// The upstream answered 2xx but the body is not JSON.
    #[error("invalid payload from {url}: {reason}")]
    InvalidPayload { url: String, reason: String },

    /// The caller abandoned the request before it completed.
    #[error("request cancelled")]
    Cancelled,

    #[error("cache key namespace {found:?} does not belong to this gateway ({expected:?})")]
    ForeignNamespace { expected: String, found: String },
}

impl GatewayError {
    /// Whether a stale cached copy may stand in for this failure.
    pub fn allows_stale_fallback(&self) -> bool {
        matches!(
            self,
            GatewayError::FetchFailure { .. } | GatewayError::InvalidPayload { .. }
        )
    }

    pub(crate) fn fetch(url: &str, status: Option<u16>, reason: impl ToString) -> Self {
        GatewayError::FetchFailure {
            url: url.to_string(),
            status,
            reason: reason.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {s}"))
        .unwrap_or_default()
}
