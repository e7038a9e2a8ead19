//! Duplex conversation transport
//!
//! A transport opens one bidirectional call per turn: it pulls the lazy request
//! stream while the caller consumes the lazy response stream. Connection-level
//! retries belong here; application errors arrive inside `InboundMessage`.

use crate::protocol::InboundMessage;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub use crate::encoder::OutboundStream;

/// Responses for one call, ending when the service closes the stream
pub type InboundStream = BoxStream<'static, Result<InboundMessage, TransportError>>;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed response: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Bidirectional streaming call to the conversation service
pub trait Transport: Send + Sync + 'static {
    /// Start a call that sends `requests` and yields responses until the
    /// service closes the stream or `deadline` elapses.
    fn converse(
        &self,
        requests: OutboundStream,
        deadline: Duration,
    ) -> BoxFuture<'_, Result<InboundStream, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn converse(
        &self,
        requests: OutboundStream,
        deadline: Duration,
    ) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
        (**self).converse(requests, deadline)
    }
}
