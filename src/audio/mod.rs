//! Audio plumbing for live sessions
//!
//! Microphone capture and framing, PCM16 wire codec, resampling, the output
//! mixer that acts as the playback clock, and the analyser used for telemetry.
//! Hardware access sits behind the [`AudioDevices`] trait so sessions can run
//! against fakes in tests.

mod analyser;
mod capture;
mod codec;
mod device;
mod mixer;
mod resample;

pub use analyser::{average_level, FrequencyAnalyser, ANALYSER_FFT_SIZE};
pub use capture::{
    frame_rms, is_speech, spawn_capture, CaptureConfig, CaptureHandle, CaptureStats,
    FrameAssembler, SPEECH_RMS_THRESHOLD,
};
pub use codec::{
    decode_base64_samples, decode_pcm16, encode_frame, encode_pcm16, parse_pcm_rate,
    pcm_mime_type, AudioBuffer, DecodeError, EncodedFrame, InboundDecoder,
};
pub use device::{AudioDevices, CpalDevices, DeviceHandle, Speaker};
pub use mixer::{Mixer, SinkError, VoiceId};
pub use resample::StreamResampler;

/// Sample rate the live service expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the audio the live service streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per outbound frame (~256ms at 16kHz).
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Errors raised while acquiring or running audio devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    PermissionDenied(String),
    DeviceUnavailable(String),
    StreamCreationFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::PermissionDenied(e) => write!(f, "Microphone permission denied: {}", e),
            AudioError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for AudioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        let err = AudioError::PermissionDenied("blocked by user".to_string());
        assert!(err.to_string().contains("blocked by user"));

        let err = AudioError::NoOutputDevice;
        assert!(err.to_string().contains("output"));
    }
}
