use serde_json::Value as JsonValue;

/// Error type returned by the fetch client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failure below HTTP reported by `reqwest`. Timeouts, connect, request
    /// and body read failures are retryable.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Server answered with a 4xx/5xx status.
    #[error("http error {status}: {message}")]
    Http {
        status: u16,
        /// `detail` from the JSON error body, or a generic message.
        message: String,
        /// Parsed JSON error body, when the body was JSON.
        detail: Option<JsonValue>,
    },
    /// Success response whose body is not the expected JSON.
    #[error("decode error: {0}")]
    Decode(String),
    /// The request could not be built (bad URL, header, or body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Whether the failure happened below HTTP and may succeed on retry.
    ///
    /// Statuses are never retryable here; a [`RetryPolicy`](crate::RetryPolicy)
    /// can still opt specific statuses in.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(inner) => should_retry_transport(inner),
            _ => false,
        }
    }

    /// HTTP status for server-reported failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn should_retry_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_request() || err.is_body() || err.is_connect()
}

/// Error type of the reconnecting event channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A connection attempt failed.
    #[error("connect error: {0}")]
    Connect(String),
    /// The live connection failed while reading or writing.
    #[error("transport error: {0}")]
    Transport(String),
    /// An outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// An inbound frame is not a `{"type": ...}` JSON object.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The channel driver is no longer running.
    #[error("channel driver has shut down")]
    Shutdown,
}
