//! Session state machine
//!
//! All lifecycle transitions go through `reduce()`, which returns the next
//! state and a list of effects for the session loop to execute. Every event
//! that originates from a connection attempt carries that attempt's session
//! id, so events from a torn-down session are recognised and dropped.

use uuid::Uuid;

use super::{SessionConfig, SessionError};
use crate::audio::VoiceId;
use crate::live::{AudioChunk, InboundMessage};
use crate::transcript::LogEvent;

pub const CONNECTED_TEXT: &str = "Connected to Gemini Live";
pub const CLOSED_TEXT: &str = "Connection closed";
pub const INTERRUPTED_TEXT: &str = "Interruption detected";
pub const DISCONNECTED_TEXT: &str = "Disconnected";

/// Authoritative session state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting {
        session_id: Uuid,
    },
    Connected {
        session_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl State {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id } | State::Connected { session_id } => Some(*session_id),
            State::Disconnected | State::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Collaborator asked to start a session
    Connect { config: SessionConfig },
    /// Collaborator asked to end the session
    Disconnect,
    /// Application exit requested
    Exit,

    // Connection attempt
    /// Devices and transport are ready (resources are held by the loop)
    Opened { id: Uuid },
    OpenFailed { id: Uuid, error: SessionError },

    // Live connection
    Inbound { id: Uuid, message: InboundMessage },
    PlaybackEnded { id: Uuid, voice: VoiceId },
    TransportClosed { id: Uuid },
    TransportFailed { id: Uuid, reason: String },
}

/// Why a live or pending session was torn down.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    UserDisconnect,
    RemoteClosed,
    TransportFailed(String),
    OpenFailed(String),
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserDisconnect => "user_disconnect",
            EndReason::RemoteClosed => "remote_closed",
            EndReason::TransportFailed(_) => "transport_failed",
            EndReason::OpenFailed(_) => "open_failed",
            EndReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Effect {
    /// Acquire speaker and microphone, then open the transport
    Open { id: Uuid, config: SessionConfig },
    /// Wire capture to the transport and start dispatch, playback and telemetry
    Activate { id: Uuid },
    /// Free resources of a connection that finished opening too late
    Release { id: Uuid },
    /// Decode and schedule an audio chunk
    Play { chunk: AudioChunk },
    /// Halt all in-flight playback and reset the playback clock
    Flush,
    /// Model turn ended; play out audio still held by the decoder
    FinishTurn,
    /// A buffer finished playing on its own
    Retire { voice: VoiceId },
    Log(LogEvent),
    /// Release every session resource and reset telemetry
    Teardown { reason: EndReason },
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitStatus after a status change
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Disconnected / Error: ready for a fresh session
        // -----------------
        (Disconnected, Connect { config }) | (Error { .. }, Connect { config }) => {
            let id = Uuid::new_v4();
            (
                Connecting { session_id: id },
                vec![Open { id, config }, EmitStatus],
            )
        }
        (Disconnected, Disconnect) => (Disconnected, vec![]),
        // Resources were released on the way into Error
        (Error { .. }, Disconnect) => (Disconnected, vec![EmitStatus]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, Opened { id }) if *session_id == id => (
            Connected { session_id: id },
            vec![
                Activate { id },
                Log(LogEvent::system(CONNECTED_TEXT)),
                EmitStatus,
            ],
        ),
        (Connecting { session_id }, OpenFailed { id, error }) if *session_id == id => {
            let message = error.to_string();
            (
                Error {
                    message: message.clone(),
                },
                vec![
                    Teardown {
                        reason: EndReason::OpenFailed(message),
                    },
                    Log(LogEvent::system(error.transcript_text())),
                    EmitStatus,
                ],
            )
        }

        // -----------------
        // Connected: single dispatcher for inbound traffic
        // -----------------
        (Connected { session_id }, Inbound { id, message }) if *session_id == id => {
            let effects = match message {
                InboundMessage::OutputTranscription(text) => vec![Log(LogEvent::model(text))],
                InboundMessage::InputTranscription(text) => vec![Log(LogEvent::user(text))],
                InboundMessage::Audio(chunk) => vec![Play { chunk }],
                InboundMessage::Interrupted => {
                    vec![Flush, Log(LogEvent::system(INTERRUPTED_TEXT))]
                }
                InboundMessage::TurnComplete => vec![FinishTurn],
            };
            (state.clone(), effects)
        }
        (Connected { session_id }, PlaybackEnded { id, voice }) if *session_id == id => {
            (state.clone(), vec![Retire { voice }])
        }
        (Connected { session_id }, TransportClosed { id }) if *session_id == id => (
            Disconnected,
            vec![
                Teardown {
                    reason: EndReason::RemoteClosed,
                },
                Log(LogEvent::system(CLOSED_TEXT)),
                EmitStatus,
            ],
        ),
        (Connected { session_id }, TransportFailed { id, reason }) if *session_id == id => (
            Error {
                message: reason.clone(),
            },
            vec![
                Teardown {
                    reason: EndReason::TransportFailed(reason.clone()),
                },
                Log(LogEvent::system(format!("Error: {}", reason))),
                EmitStatus,
            ],
        ),

        // -----------------
        // Disconnect from a live or pending session
        // -----------------
        (Connecting { .. }, Disconnect) | (Connected { .. }, Disconnect) => (
            Disconnected,
            vec![
                Teardown {
                    reason: EndReason::UserDisconnect,
                },
                Log(LogEvent::system(DISCONNECTED_TEXT)),
                EmitStatus,
            ],
        ),

        // A session is already starting or running
        (Connecting { .. }, Connect { .. }) | (Connected { .. }, Connect { .. }) => {
            log::debug!("Connect ignored: session already active");
            (state.clone(), vec![])
        }

        // -----------------
        // Stale events
        // -----------------
        // A connection that opened after its session was abandoned still
        // holds devices
        (_, Opened { id }) if !is_current(id) => (state.clone(), vec![Release { id }]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
