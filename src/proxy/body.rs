use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sync_wrapper::SyncWrapper;

use crate::error::{ProxyError, ProxyResult};

enum BodyState {
    /// Raw inbound body, nothing consumed yet.
    Pending(SyncWrapper<Body>),
    /// Fully materialized payload, replayable any number of times.
    Buffered(Bytes),
    /// Buffer released at request teardown.
    Closed,
}

/// Request payload wrapper that buffers the inbound body so it can be
/// re-sent on failover. The whole payload lands in memory on first read;
/// payloads over the limit are refused rather than truncated.
pub struct ReplayableBody {
    state: BodyState,
    limit: usize,
}

impl ReplayableBody {
    pub fn new(body: Body, limit: usize) -> Self {
        Self {
            state: BodyState::Pending(SyncWrapper::new(body)),
            limit,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let limit = bytes.len().max(1);
        Self {
            state: BodyState::Buffered(bytes),
            limit,
        }
    }

    /// Returns the full payload, materializing it on first use. Subsequent
    /// calls are cheap clones of the same buffer, which is what makes the
    /// byte stream identical across failover attempts.
    pub async fn buffered(&mut self) -> ProxyResult<Bytes> {
        match &mut self.state {
            BodyState::Buffered(bytes) => Ok(bytes.clone()),
            BodyState::Closed => Err(ProxyError::BodyRead("body already released".to_string())),
            BodyState::Pending(body) => {
                let mut stream =
                    std::mem::replace(body.get_mut(), Body::empty()).into_data_stream();
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| ProxyError::BodyRead(e.to_string()))?;
                    if buf.len() + chunk.len() > self.limit {
                        self.state = BodyState::Closed;
                        return Err(ProxyError::PayloadTooLarge(self.limit));
                    }
                    buf.extend_from_slice(&chunk);
                }
                let bytes = buf.freeze();
                self.state = BodyState::Buffered(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Seek back to the start. Trivially succeeds before the first read and
    /// after buffering; fails only once the buffer has been released.
    pub fn rewind(&mut self) -> ProxyResult<()> {
        match self.state {
            BodyState::Closed => Err(ProxyError::BodyRead("body already released".to_string())),
            _ => Ok(()),
        }
    }

    pub fn len(&self) -> Option<usize> {
        match &self.state {
            BodyState::Buffered(bytes) => Some(bytes.len()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.state, BodyState::Buffered(b) if b.is_empty())
    }

    /// Reads and discards whatever is left of the inbound payload so the
    /// client can receive an error response instead of a dropped
    /// connection.
    pub async fn drain(&mut self) {
        if let BodyState::Pending(body) = &mut self.state {
            let mut stream =
                std::mem::replace(body.get_mut(), Body::empty()).into_data_stream();
            while let Some(chunk) = stream.next().await {
                if chunk.is_err() {
                    break;
                }
            }
            self.state = BodyState::Buffered(Bytes::new());
        }
    }

    /// Releases the buffer. Further reads fail, further rewinds fail.
    pub fn close(&mut self) {
        self.state = BodyState::Closed;
    }
}
