use serde::Serialize;

/// Failure of a single request, plain or streamed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("request aborted")]
    Aborted,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl FetchError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// HTTP 429 from the upstream API
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// User-facing error classes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
pub enum ErrorKind {
    /// Plain fetch rejected or answered with non-2xx
    NetworkFailure,
    /// Transport, status or decode error while streaming
    StreamFailure,
    /// User cancelled a stream; never shown as an error
    StreamAborted,
}

/// What the UI needs to show an error and offer a retry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn network(err: &FetchError) -> Self {
        Self {
            kind: ErrorKind::NetworkFailure,
            message: err.to_string(),
            retryable: true,
        }
    }

    pub fn stream(err: &FetchError) -> Self {
        if err.is_aborted() {
            return Self {
                kind: ErrorKind::StreamAborted,
                message: String::new(),
                retryable: false,
            };
        }
        Self {
            kind: ErrorKind::StreamFailure,
            message: err.to_string(),
            retryable: true,
        }
    }
}
