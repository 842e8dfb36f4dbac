use http::StatusCode;
use thiserror::Error;

/// Failures of a single relayed completion.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid message list: {0}")]
    Validation(String),
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("Upstream request failed: {0}")]
    UpstreamTransport(#[source] anyhow::Error),
    #[error("Upstream responded with status {status}")]
    UpstreamStatus { status: StatusCode, body: String },
    #[error("Cannot parse upstream event {data:?}: {reason}")]
    UpstreamParse { data: String, reason: String },
    #[error("Upstream stream ended before completion")]
    UpstreamTruncated,
}

impl RelayError {
    /// Status of the response reporting this error to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamTransport(_)
            | Self::UpstreamStatus { .. }
            | Self::UpstreamParse { .. }
            | Self::UpstreamTruncated => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
