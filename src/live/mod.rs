//! Live conversational speech service transport
//!
//! The session talks to the remote service through [`LiveTransport`], which
//! opens a [`LiveLink`]: a bounded outbound queue of encoded microphone frames
//! and a single ordered stream of [`InboundEvent`]s. The WebSocket client in
//! [`client`] is the production implementation.
//!
//! # Connection Flow
//!
//! 1. `open()` - connect, send the setup message, wait for the acknowledgement
//! 2. Capture pipeline pushes frames into `LiveLink::outbound()`
//! 3. Session loop drains `LiveLink::take_inbound()` one event at a time
//! 4. `close()` (or drop) - tear the connection down

pub mod client;
mod protocol;

use std::str::FromStr;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::EncodedFrame;

pub use client::{get_api_key, GeminiLiveClient, DEFAULT_MODEL};
pub use protocol::{ClientMessage, ServerMessage};

/// Prebuilt voices offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Voice {
    Puck,
    Charon,
    #[default]
    Kore,
    Fenrir,
    Aoede,
    Leda,
    Orus,
    Zephyr,
}

impl Voice {
    pub const ALL: [Voice; 8] = [
        Voice::Puck,
        Voice::Charon,
        Voice::Kore,
        Voice::Fenrir,
        Voice::Aoede,
        Voice::Leda,
        Voice::Orus,
        Voice::Zephyr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Puck => "Puck",
            Voice::Charon => "Charon",
            Voice::Kore => "Kore",
            Voice::Fenrir => "Fenrir",
            Voice::Aoede => "Aoede",
            Voice::Leda => "Leda",
            Voice::Orus => "Orus",
            Voice::Zephyr => "Zephyr",
        }
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVoiceError(String);

impl std::fmt::Display for ParseVoiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = Voice::ALL.iter().map(|v| v.as_str()).collect();
        write!(
            f,
            "Unknown voice '{}' (expected one of: {})",
            self.0,
            names.join(", ")
        )
    }
}

impl std::error::Error for ParseVoiceError {}

impl FromStr for Voice {
    type Err = ParseVoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseVoiceError(wanted.to_string()))
    }
}

/// Configuration sent once when the link opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub system_prompt: String,
    pub voice: Voice,
    pub audio_output_requested: bool,
    pub input_transcription_requested: bool,
    pub output_transcription_requested: bool,
}

impl SessionSetup {
    /// Audio replies with both sides transcribed.
    pub fn conversation(system_prompt: impl Into<String>, voice: Voice) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            voice,
            audio_output_requested: true,
            input_transcription_requested: true,
            output_transcription_requested: true,
        }
    }
}

/// Inline audio from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Base64 PCM16
    pub data: String,
    /// Declared encoding, e.g. `audio/pcm;rate=24000`
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Transcription of the model's spoken reply
    OutputTranscription(String),
    /// Transcription of the user's speech
    InputTranscription(String),
    Audio(AudioChunk),
    /// The service dropped its current turn because the user barged in
    Interrupted,
    TurnComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// Remote end closed the connection
    Closed,
    /// Transport failure with a human-readable reason
    Error(String),
}

/// An open connection to the live service. Dropping it shuts the connection
/// down.
pub struct LiveLink {
    outbound: mpsc::Sender<EncodedFrame>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    shutdown: CancellationToken,
}

impl LiveLink {
    pub fn new(
        outbound: mpsc::Sender<EncodedFrame>,
        inbound: mpsc::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            shutdown,
        }
    }

    /// Queue for outbound audio frames.
    pub fn outbound(&self) -> mpsc::Sender<EncodedFrame> {
        self.outbound.clone()
    }

    /// Take the inbound event stream. Returns `None` if already taken.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound.take()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the connection.
    pub fn close(self) {
        self.shutdown.cancel();
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens links to a live speech service.
pub trait LiveTransport: Send + Sync + 'static {
    /// Connect and send `setup`. Resolves once the service acknowledges it.
    fn open(&self, setup: SessionSetup) -> BoxFuture<'static, Result<LiveLink, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// API key not configured
    MissingApiKey,
    /// Could not establish the connection
    ConnectionFailed(String),
    /// The service refused the setup message
    SetupRejected(String),
    /// Unexpected or malformed traffic
    ProtocolError(String),
    /// Connection closed before it was ready
    Disconnected(String),
    /// No acknowledgement within the connect timeout
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::MissingApiKey => {
                write!(
                    f,
                    "Gemini API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            TransportError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Gemini Live: {}", e)
            }
            TransportError::SetupRejected(e) => write!(f, "Session setup rejected: {}", e),
            TransportError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
            TransportError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            TransportError::Timeout => write!(f, "Timed out waiting for Gemini Live"),
        }
    }
}

impl std::error::Error for TransportError {}
