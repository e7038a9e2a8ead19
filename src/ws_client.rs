//! WebSocket transport for the conversation service
//!
//! Each turn opens one connection. The socket is split: a writer task pulls the
//! request stream and sends JSON text frames, while the returned response stream
//! reads frames until the service closes the socket or the deadline elapses.

use crate::config::TransportConfig;
use crate::protocol::InboundMessage;
use crate::transport::{InboundStream, OutboundStream, Transport, TransportError};

use futures_util::future::BoxFuture;
use futures_util::stream::{self, SplitStream};
use futures_util::{FutureExt, Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use std::time::Duration;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of the socket, owned by the response stream
type WsStream = SplitStream<WsConnection>;

pub struct WsTransport {
    config: TransportConfig,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect, retrying while the service reports itself unavailable.
    async fn connect(&self, deadline: Instant) -> Result<WsConnection, TransportError> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match timeout_at(deadline, self.connect_once()).await {
                Ok(result) => result,
                Err(_) => return Err(TransportError::DeadlineExceeded),
            };
            match result {
                Ok(ws) => return Ok(ws),
                Err(e) if e.is_unavailable() && attempt < attempts => {
                    warn!(
                        "Connection attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        attempts,
                        e,
                        self.config.reconnect_delay()
                    );
                    sleep(self.config.reconnect_delay()).await;
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", self.config.url, e);
                    return Err(e);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<WsConnection, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        if let Some(token) = &self.config.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!("Connecting to conversation service at {}", self.config.url);
        let (ws, resp) = connect_async(request).await.map_err(connect_error)?;
        debug!("WebSocket connection response: {:?}", resp.status());
        Ok(ws)
    }
}

impl Transport for WsTransport {
    fn converse(
        &self,
        requests: OutboundStream,
        deadline: Duration,
    ) -> BoxFuture<'_, Result<InboundStream, TransportError>> {
        async move {
            let deadline = Instant::now() + deadline;
            let ws = self.connect(deadline).await?;
            let (sink, stream) = ws.split();

            let (failed_tx, write_failure) = oneshot::channel();
            let writer = tokio::spawn(write_requests(sink, requests, failed_tx));
            let reader = Reader {
                stream,
                deadline,
                writer,
                write_failure,
                writer_done: false,
                finished: false,
            };

            let responses = stream::unfold(reader, |mut reader| async move {
                let item = reader.next_message().await?;
                Some((item, reader))
            });
            Ok(responses.boxed())
        }
        .boxed()
    }
}

/// Send every request as a text frame, then mark the end of input.
///
/// A failed send is reported through `failed` and ends the response stream.
async fn write_requests<S>(
    mut sink: S,
    mut requests: OutboundStream,
    failed: oneshot::Sender<TransportError>,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut sent = 0usize;
    while let Some(message) = requests.next().await {
        debug!("Sending {}", message);
        if let Err(e) = sink.send(Message::text(message.to_json().to_string())).await {
            error!("Failed to send request {}: {}", sent, e);
            let _ = failed.send(e.into());
            return;
        }
        sent += 1;
    }

    let end = json!({ "endOfInput": true }).to_string();
    if let Err(e) = sink.send(Message::text(end)).await {
        warn!("Failed to send end of input: {}", e);
    }
    debug!("Request stream finished after {} messages", sent);
}

struct Reader {
    stream: WsStream,
    deadline: Instant,
    writer: JoinHandle<()>,
    write_failure: oneshot::Receiver<TransportError>,
    writer_done: bool,
    finished: bool,
}

impl Reader {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        if self.finished {
            return None;
        }
        loop {
            let next = tokio::select! {
                biased;

                failure = &mut self.write_failure, if !self.writer_done => match failure {
                    Ok(e) => return self.fail(e),
                    Err(_) => {
                        self.writer_done = true;
                        continue;
                    }
                },

                next = timeout_at(self.deadline, self.stream.next()) => next,
            };
            let frame = match next {
                Err(_) => return self.fail(TransportError::DeadlineExceeded),
                Ok(None) => return self.finish(),
                Ok(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
                    return self.finish()
                }
                Ok(Some(Err(e))) => return self.fail(e.into()),
                Ok(Some(Ok(frame))) => frame,
            };

            let decoded = match frame {
                Message::Text(text) => serde_json::from_str::<InboundMessage>(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice::<InboundMessage>(&bytes),
                Message::Close(frame) => {
                    debug!("Service closed the stream: {:?}", frame);
                    return self.finish();
                }
                _ => continue,
            };

            return match decoded {
                Ok(message) => {
                    debug!("Received {}", message);
                    Some(Ok(message))
                }
                Err(e) => self.fail(e.into()),
            };
        }
    }

    fn finish(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        self.finished = true;
        None
    }

    fn fail(&mut self, e: TransportError) -> Option<Result<InboundMessage, TransportError>> {
        error!("Response stream failed: {}", e);
        self.finished = true;
        Some(Err(e))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

fn connect_error(e: WsError) -> TransportError {
    let unavailable = match &e {
        WsError::Io(_) => true,
        WsError::Http(resp) => resp.status() == StatusCode::SERVICE_UNAVAILABLE,
        _ => false,
    };
    if unavailable {
        TransportError::Unavailable(e.to_string())
    } else {
        TransportError::WebSocket(e)
    }
}
