use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// A response the proxy itself produced, surfaced verbatim downstream.
    #[error("http error: {status}")]
    Http {
        status: StatusCode,
        message: String,
    },

    /// Every (token, upstream) budget is exhausted.
    #[error("too many requests, retry after {retry_after}s")]
    TooManyRequests { retry_after: u64 },

    /// Network failure talking to an upstream. Retryable by failover.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The control plane rejected the request with a client error.
    #[error("control plane rejected request: {status}")]
    ControlPlane { status: StatusCode, body: String },

    /// No control server produced a usable verdict.
    #[error("control plane unavailable: {0}")]
    ControlUnavailable(String),

    /// Every candidate endpoint was tried and failed.
    #[error("all upstreams failed")]
    UpstreamsExhausted,

    /// The balancer has nothing to hand out.
    #[error("no available endpoints")]
    NoEndpoints,

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Http { status, .. } => *status,
            ProxyError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ControlPlane { status, .. } => *status,
            ProxyError::ControlUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::UpstreamsExhausted => StatusCode::BAD_GATEWAY,
            ProxyError::NoEndpoints => StatusCode::BAD_GATEWAY,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BodyRead(_) => StatusCode::BAD_REQUEST,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to the client. Internal error text never leaks.
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::Http { message, .. } => message.clone(),
            ProxyError::TooManyRequests { retry_after } => {
                format!("rate limit exceeded, retry after {} seconds", retry_after)
            }
            ProxyError::Transport(_) => "upstream request failed".to_string(),
            ProxyError::ControlPlane { body, .. } => body.clone(),
            ProxyError::ControlUnavailable(_) => "internal server error".to_string(),
            ProxyError::UpstreamsExhausted => "all upstreams failed".to_string(),
            ProxyError::NoEndpoints => "no available endpoints".to_string(),
            ProxyError::PayloadTooLarge(limit) => {
                format!("request body exceeds {} bytes", limit)
            }
            ProxyError::BodyRead(_) => "failed to read request body".to_string(),
            ProxyError::Config(_) => "internal server error".to_string(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Transport(err.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
