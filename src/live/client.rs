//! Gemini Live WebSocket client
//!
//! # Connection Flow
//!
//! 1. Establish the WebSocket (API key in the query string)
//! 2. Send `setup` and wait for `setupComplete`
//! 3. Spawn a writer task draining the outbound frame queue and a reader task
//!    turning server frames into [`InboundEvent`]s
//! 4. Cancelling the link's shutdown token stops both tasks and closes the
//!    socket
//!
//! The whole of steps 1-2 runs under a single connect timeout. There are no
//! retries: a failed open is reported to the session, which ends in `Error`.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::Request, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage};
use super::{InboundEvent, LiveLink, LiveTransport, SessionSetup, TransportError};
use crate::audio::EncodedFrame;

/// Bidirectional streaming endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used when none is configured
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound frames buffered before new ones are dropped (~8s of audio)
const DEFAULT_OUTBOUND_QUEUE: usize = 32;

const INBOUND_QUEUE: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct GeminiLiveClient {
    api_key: Option<String>,
    model: String,
    endpoint: String,
    connect_timeout: Duration,
    outbound_queue: usize,
}

impl std::fmt::Debug for GeminiLiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveClient")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("outbound_queue", &self.outbound_queue)
            .finish()
    }
}

impl GeminiLiveClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            model: DEFAULT_MODEL.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }

    /// Client using `GEMINI_API_KEY` from the environment.
    pub fn from_env() -> Self {
        Self::new(get_api_key())
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_outbound_queue(mut self, frames: usize) -> Self {
        self.outbound_queue = frames.max(1);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, api_key: &str) -> Result<Request<()>, TransportError> {
        // A bare authority needs a root path before the query
        let authority = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        let root = if authority.contains('/') { "" } else { "/" };
        format!("{}{}?key={}", self.endpoint, root, api_key)
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn connect(self, setup: SessionSetup) -> Result<LiveLink, TransportError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or(TransportError::MissingApiKey)?;
        let request = self.request(&api_key)?;

        log::info!("Connecting to Gemini Live ({})...", self.model);

        let ws = timeout(self.connect_timeout, self.handshake(request, &setup))
            .await
            .map_err(|_| TransportError::Timeout)??;

        log::info!("Gemini Live session ready (voice {})", setup.voice);
        Ok(self.spawn_link(ws))
    }

    /// Connect, send setup, wait for the acknowledgement.
    async fn handshake(
        &self,
        request: Request<()>,
        setup: &SessionSetup,
    ) -> Result<WsStream, TransportError> {
        let (mut ws, _response) = connect_async_with_config(
            request, None, false, // disable_nagle (we want low latency)
        )
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, sending setup...");

        let json = serde_json::to_string(&ClientMessage::setup(setup, &self.model))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        ws.send(Message::Text(json))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        while let Some(msg_result) = ws.next().await {
            let text = match msg_result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Ignoring non-UTF-8 frame during setup: {}", e);
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} ({})", f.reason, f.code))
                        .unwrap_or_else(|| "closed before setup completed".to_string());
                    return Err(TransportError::SetupRejected(reason));
                }
                Ok(_) => continue, // ping/pong
                Err(e) => return Err(TransportError::ProtocolError(e.to_string())),
            };

            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) if msg.is_setup_complete() => return Ok(ws),
                Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
                Err(e) => log::warn!("Failed to parse message: {}", e),
            }
        }

        Err(TransportError::Disconnected("Stream ended".to_string()))
    }

    fn spawn_link(&self, ws: WsStream) -> LiveLink {
        let (mut write, mut read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<EncodedFrame>(self.outbound_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(INBOUND_QUEUE);
        let shutdown = CancellationToken::new();

        // Writer: outbound frames -> realtimeInput
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = outbound_rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };

                    let json = match serde_json::to_string(&ClientMessage::audio(&frame)) {
                        Ok(json) => json,
                        Err(e) => {
                            log::warn!("Failed to serialize audio frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        log::warn!("Failed to send audio frame: {}", e);
                        break;
                    }
                }
                if let Err(e) = write.close().await {
                    log::debug!("Error closing WebSocket: {}", e);
                }
                log::debug!("Writer task exiting");
            });
        }

        // Reader: server frames -> InboundEvent
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                'read: loop {
                    let msg_result = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        msg = read.next() => msg,
                    };

                    let text = match msg_result {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(e) => {
                                log::warn!("Ignoring non-UTF-8 frame: {}", e);
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            match frame {
                                Some(f) => log::info!(
                                    "WebSocket closed by server: {} ({})",
                                    f.reason,
                                    f.code
                                ),
                                None => log::info!("WebSocket closed by server"),
                            }
                            let _ = inbound_tx.send(InboundEvent::Closed).await;
                            break;
                        }
                        Some(Ok(_)) => continue, // ping/pong
                        Some(Err(e)) => {
                            log::warn!("WebSocket error: {}", e);
                            let _ = inbound_tx.send(InboundEvent::Error(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = inbound_tx.send(InboundEvent::Closed).await;
                            break;
                        }
                    };

                    let msg = match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to parse message: {}", e);
                            continue;
                        }
                    };

                    if let Some(go_away) = &msg.go_away {
                        log::warn!(
                            "Server is closing the session soon (time left: {})",
                            go_away.time_left.as_deref().unwrap_or("unknown")
                        );
                    }

                    for inbound in msg.into_inbound() {
                        if inbound_tx
                            .send(InboundEvent::Message(inbound))
                            .await
                            .is_err()
                        {
                            log::debug!("Inbound channel closed");
                            break 'read;
                        }
                    }
                }
                // Stop the writer too
                shutdown.cancel();
                log::debug!("Reader task exiting");
            });
        }

        LiveLink::new(outbound_tx, inbound_rx, shutdown)
    }
}

impl LiveTransport for GeminiLiveClient {
    fn open(&self, setup: SessionSetup) -> BoxFuture<'static, Result<LiveLink, TransportError>> {
        let client = self.clone();
        Box::pin(client.connect(setup))
    }
}

/// Get the Gemini API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
