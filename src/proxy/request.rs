use axum::http::{HeaderMap, Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::time::Duration;

use crate::proxy::body::ReplayableBody;
use crate::proxy::endpoint::Endpoint;

/// What one forwarding attempt produced: either response headers from the
/// upstream or a transport-level failure.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Response(StatusCode),
    Error(String),
}

/// One upstream try, appended to the request in chronological order as the
/// forwarder progresses. Observers and the weight handler read these.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub endpoint: Endpoint,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

impl Attempt {
    /// Transport errors and server errors both count as failures for
    /// failover and for endpoint health tracking.
    pub fn failed(&self) -> bool {
        match &self.outcome {
            AttemptOutcome::Error(_) => true,
            AttemptOutcome::Response(status) => status.is_server_error(),
        }
    }
}

/// The inbound unit of work flowing through the pipeline.
pub struct ProxyRequest {
    pub id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: ReplayableBody,
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub host: String,
    attempts: Vec<Attempt>,
}

impl ProxyRequest {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: ReplayableBody,
        remote_addr: SocketAddr,
    ) -> Self {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body,
            remote_addr,
            tls: false,
            host,
            attempts: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn add_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}
