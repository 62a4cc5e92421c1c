use thiserror::Error;

#[derive(Debug, Error)]
pub enum PinguApiError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(#[source] url::ParseError),
}

impl PinguApiError {
    /// Network/5xx failures are retryable by the task loop; 4xx failures are
    /// not (`spec.md` §7: PinguAPIError "surfaced, task ERROR, loop
    /// continues" rather than retried in place).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } | Self::Decode { .. } => true,
            Self::Status { status, .. } => status.is_server_error(),
            Self::InvalidBaseUrl(_) => false,
        }
    }
}
