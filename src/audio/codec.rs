//! PCM16 wire codec
//!
//! Outbound frames are mono f32 samples packed as 16-bit signed little-endian
//! PCM and base64 encoded, tagged with `audio/pcm;rate=<hz>`. Inbound chunks
//! use the same packing at the service's output rate and are decoded back to
//! f32, then streamed through a resampler when the playback rate differs.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::resample::StreamResampler;

/// A frame ready to hand to the live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Base64 of little-endian PCM16 samples
    pub data: String,
    /// Encoding identifier, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

/// Decoded, playable mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Errors from decoding an inbound audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload was not valid base64
    Base64(String),
    /// Payload length is not a whole number of 16-bit samples
    OddLength { len: usize },
    /// Resampling to the playback rate failed
    Resample(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Base64(e) => write!(f, "Invalid base64 audio payload: {}", e),
            DecodeError::OddLength { len } => {
                write!(f, "PCM16 payload has odd length ({} bytes)", len)
            }
            DecodeError::Resample(e) => write!(f, "Failed to resample audio: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encoding identifier for PCM16 at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from an encoding identifier.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse::<u32>().ok())
        .filter(|rate| *rate > 0)
}

fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

fn i16_to_sample(value: i16) -> f32 {
    if value < 0 {
        value as f32 / 32768.0
    } else {
        value as f32 / 32767.0
    }
}

/// Pack samples as PCM16 little-endian. Out-of-range samples are clamped.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Encode a captured frame for the wire.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    EncodedFrame {
        data: STANDARD.encode(encode_pcm16(samples)),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Unpack PCM16 little-endian bytes into f32 samples in [-1, 1].
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength { len: bytes.len() });
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Decode a base64 PCM16 payload into f32 samples.
pub fn decode_base64_samples(data: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode_pcm16(&bytes)
}

/// Turns inbound chunks into buffers at the playback rate.
///
/// Chunks that need resampling share one streaming resampler per source rate,
/// so filter state carries across chunk boundaries and consecutive chunks
/// join without seams. The resampler holds back a little audio; call
/// [`finish_turn`](Self::finish_turn) when the model's turn ends to get it,
/// or [`reset`](Self::reset) to throw it away after an interruption.
pub struct InboundDecoder {
    target_rate: u32,
    stream: Option<(u32, StreamResampler)>,
}

impl InboundDecoder {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            stream: None,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn decode(&mut self, data: &str, source_rate: u32) -> Result<AudioBuffer, DecodeError> {
        let samples = decode_base64_samples(data)?;

        // A rate change ends the previous stream
        let switching = matches!(&self.stream, Some((rate, _)) if *rate != source_rate);
        let mut output = if switching {
            let tail = self.finish_turn()?.samples;
            self.stream = None;
            tail
        } else {
            Vec::new()
        };

        if source_rate == self.target_rate {
            output.extend(samples);
            return Ok(AudioBuffer::new(output, self.target_rate));
        }

        if self.stream.is_none() {
            let stream = StreamResampler::new(source_rate, self.target_rate)
                .map_err(DecodeError::Resample)?;
            self.stream = Some((source_rate, stream));
        }
        if let Some((_, stream)) = &mut self.stream {
            output.extend(stream.push(&samples).map_err(DecodeError::Resample)?);
        }
        Ok(AudioBuffer::new(output, self.target_rate))
    }

    /// Drain audio still held by the resampler.
    pub fn finish_turn(&mut self) -> Result<AudioBuffer, DecodeError> {
        let samples = match &mut self.stream {
            Some((_, stream)) => stream.finish().map_err(DecodeError::Resample)?,
            None => Vec::new(),
        };
        Ok(AudioBuffer::new(samples, self.target_rate))
    }

    pub fn reset(&mut self) {
        if let Some((_, stream)) = &mut self.stream {
            stream.reset();
        }
    }
}
