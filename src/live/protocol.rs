//! Gemini Live API protocol types
//!
//! JSON messages exchanged over the `BidiGenerateContent` WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Client sends `setup` (model, response modalities, voice, system
//!    instruction, transcription flags)
//! 2. Server answers `setupComplete`
//! 3. Client streams microphone audio as `realtimeInput.mediaChunks`
//! 4. Server streams `serverContent`: inline audio parts, transcriptions of
//!    both sides, `interrupted` and `turnComplete` flags
//! 5. Server may send `goAway` shortly before closing the connection

use serde::{Deserialize, Serialize};

use super::{AudioChunk, InboundMessage, SessionSetup};
use crate::audio::EncodedFrame;

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup message for a session.
    pub fn setup(setup: &SessionSetup, model: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        let response_modalities = if setup.audio_output_requested {
            vec!["AUDIO".to_string()]
        } else {
            vec!["TEXT".to_string()]
        };

        let system_instruction = if setup.system_prompt.trim().is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part {
                    text: Some(setup.system_prompt.clone()),
                    inline_data: None,
                }],
            })
        };

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities,
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.as_str().to_string(),
                        },
                    },
                }),
            },
            system_instruction,
            input_audio_transcription: setup
                .input_transcription_requested
                .then_some(AudioTranscriptionConfig {}),
            output_audio_transcription: setup
                .output_transcription_requested
                .then_some(AudioTranscriptionConfig {}),
        })
    }

    /// Wrap one encoded microphone frame.
    pub fn audio(frame: &EncodedFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: frame.mime_type.clone(),
                data: frame.data.clone(),
            }],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Presence enables transcription; the object itself has no fields.
#[derive(Debug, Clone, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ============================================================================
// Shared content types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// One server frame. Exactly one field is normally set; unknown fields such
/// as tool calls or usage metadata are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<SetupComplete>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupComplete {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

fn non_empty(transcription: Option<Transcription>) -> Option<String> {
    transcription
        .and_then(|t| t.text)
        .filter(|text| !text.is_empty())
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into session messages, in dispatch order: model transcription,
    /// user transcription, every inline audio part, interruption, turn end.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };

        let mut messages = Vec::new();

        if let Some(text) = non_empty(content.output_transcription) {
            messages.push(InboundMessage::OutputTranscription(text));
        }
        if let Some(text) = non_empty(content.input_transcription) {
            messages.push(InboundMessage::InputTranscription(text));
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    if blob.data.is_empty() {
                        continue;
                    }
                    messages.push(InboundMessage::Audio(AudioChunk {
                        data: blob.data,
                        mime_type: blob.mime_type,
                    }));
                }
            }
        }
        if content.interrupted.unwrap_or(false) {
            messages.push(InboundMessage::Interrupted);
        }
        if content.turn_complete.unwrap_or(false) {
            messages.push(InboundMessage::TurnComplete);
        }

        messages
    }
}
