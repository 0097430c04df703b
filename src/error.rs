use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RelayError {
    /// Upstream HTTP status, when the failure carried one.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
