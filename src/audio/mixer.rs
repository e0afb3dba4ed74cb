//! Output mixer and playback clock
//!
//! The mixer owns the timeline of the output device. Its clock advances only
//! as frames are rendered by the device callback, so `current_time()` is the
//! sink's notion of "now". Voices are scheduled at absolute times on that
//! timeline and mixed sample-accurately, which is what lets the playback
//! scheduler chain buffers with no gap and no overlap.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Identifier of one scheduled buffer on the mixer.
pub type VoiceId = u64;

/// Samples kept for output analysis.
const TAP_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// The output sink has been closed
    Closed,
    /// The voice already finished or was never scheduled
    UnknownVoice(VoiceId),
    /// Buffer sample rate does not match the sink
    RateMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Closed => write!(f, "Output sink is closed"),
            SinkError::UnknownVoice(id) => write!(f, "Voice {} is not playing", id),
            SinkError::RateMismatch { expected, actual } => write!(
                f,
                "Buffer sample rate {} Hz does not match sink rate {} Hz",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for SinkError {}

struct Voice {
    id: VoiceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerState {
    /// Frames rendered since the mixer was created
    position: u64,
    next_id: VoiceId,
    voices: Vec<Voice>,
    tap: VecDeque<f32>,
    scratch: Vec<f32>,
    closed: bool,
}

pub struct Mixer {
    sample_rate: u32,
    state: Mutex<MixerState>,
    ended_tx: mpsc::UnboundedSender<VoiceId>,
}

impl Mixer {
    /// Create a mixer and the receiver on which naturally finished voices are
    /// reported.
    pub fn new(sample_rate: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<VoiceId>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mixer = Arc::new(Self {
            sample_rate: sample_rate.max(1),
            state: Mutex::new(MixerState {
                position: 0,
                next_id: 1,
                voices: Vec::new(),
                tap: VecDeque::with_capacity(TAP_CAPACITY),
                scratch: Vec::new(),
                closed: false,
            }),
            ended_tx,
        });
        (mixer, ended_rx)
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Sink time in seconds.
    pub fn current_time(&self) -> f64 {
        self.lock().position as f64 / self.sample_rate as f64
    }

    /// Schedule `samples` to begin at `when` seconds on the sink timeline.
    /// A time already in the past starts at the next rendered frame.
    pub fn start_at(&self, samples: Vec<f32>, when: f64) -> Result<VoiceId, SinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }

        let requested = (when.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(state.position);

        let id = state.next_id;
        state.next_id += 1;
        state.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        Ok(id)
    }

    /// Halt a voice immediately. Stopped voices are not reported as ended.
    pub fn stop(&self, id: VoiceId) -> Result<(), SinkError> {
        let mut state = self.lock();
        let before = state.voices.len();
        state.voices.retain(|v| v.id != id);
        if state.voices.len() == before {
            return Err(SinkError::UnknownVoice(id));
        }
        Ok(())
    }

    /// Number of voices scheduled or playing.
    pub fn active_voices(&self) -> usize {
        self.lock().voices.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Silence everything and reject further scheduling.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.voices.clear();
        state.tap.clear();
    }

    /// Fill an interleaved output buffer and advance the clock.
    ///
    /// This is the body of the device callback; every channel receives the
    /// same mono mix.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        let mut state = self.lock();
        let state = &mut *state;

        state.scratch.clear();
        state.scratch.resize(frames, 0.0);

        let block_start = state.position;
        let block_end = block_start + frames as u64;

        for voice in &state.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for t in from..to {
                state.scratch[(t - block_start) as usize] +=
                    voice.samples[(t - voice.start_frame) as usize];
            }
        }

        for (frame, &value) in out.chunks_mut(channels).zip(state.scratch.iter()) {
            let value = value.clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|s| *s = value);
        }
        // Trailing partial frame, if any
        let written = frames * channels;
        out[written..].iter_mut().for_each(|s| *s = 0.0);

        let overflow = (state.tap.len() + frames).saturating_sub(TAP_CAPACITY);
        state.tap.drain(..overflow.min(state.tap.len()));
        let skip = frames.saturating_sub(TAP_CAPACITY);
        state
            .tap
            .extend(state.scratch.iter().skip(skip).map(|s| s.clamp(-1.0, 1.0)));

        state.position = block_end;

        let position = state.position;
        let ended_tx = &self.ended_tx;
        state.voices.retain(|voice| {
            if voice.end_frame() <= position {
                let _ = ended_tx.send(voice.id);
                false
            } else {
                true
            }
        });
    }

    /// The most recent `len` rendered samples, oldest first, zero padded at
    /// the front if fewer are available.
    pub fn recent_output(&self, len: usize) -> Vec<f32> {
        let state = self.lock();
        let available = state.tap.len().min(len);
        let mut out = vec![0.0; len - available];
        out.extend(state.tap.iter().skip(state.tap.len() - available));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_with_render() {
        let (mixer, _ended) = Mixer::new(1000);
        assert_eq!(mixer.current_time(), 0.0);
        let mut out = vec![0.0; 500];
        mixer.render(&mut out, 1);
        assert!((mixer.current_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_voice_plays_at_scheduled_frame() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.5; 4], 0.002).unwrap();
        let mut out = vec![0.0; 8];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_past_start_time_plays_immediately() {
        let (mixer, _ended) = Mixer::new(1000);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 1);
        mixer.start_at(vec![0.25; 2], 0.0).unwrap();
        mixer.render(&mut out[..4], 1);
        assert_eq!(&out[..4], &[0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_back_to_back_voices_have_no_gap() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.1; 3], 0.0).unwrap();
        mixer.start_at(vec![0.2; 3], 0.003).unwrap();
        let mut out = vec![0.0; 6];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn test_render_fills_every_channel() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.5, -0.5], 0.0).unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_finished_voice_is_reported() {
        let (mixer, mut ended) = Mixer::new(1000);
        let id = mixer.start_at(vec![0.5; 2], 0.0).unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(ended.try_recv().unwrap(), id);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_stopped_voice_is_silent_and_not_reported() {
        let (mixer, mut ended) = Mixer::new(1000);
        let id = mixer.start_at(vec![0.5; 2], 0.0).unwrap();
        mixer.stop(id).unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(ended.try_recv().is_err());
        assert_eq!(mixer.stop(id), Err(SinkError::UnknownVoice(id)));
    }

    #[test]
    fn test_closed_mixer_rejects_voices() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.5; 2], 0.0).unwrap();
        mixer.close();
        assert_eq!(mixer.active_voices(), 0);
        assert_eq!(mixer.start_at(vec![0.5], 0.0), Err(SinkError::Closed));
    }

    #[test]
    fn test_recent_output_keeps_latest_samples() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.1, 0.2, 0.3], 0.0).unwrap();
        let mut out = vec![0.0; 3];
        mixer.render(&mut out, 1);
        assert_eq!(mixer.recent_output(2), vec![0.2, 0.3]);
        assert_eq!(mixer.recent_output(5), vec![0.0, 0.0, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_mix_is_clamped() {
        let (mixer, _ended) = Mixer::new(1000);
        mixer.start_at(vec![0.8], 0.0).unwrap();
        mixer.start_at(vec![0.8], 0.0).unwrap();
        let mut out = vec![0.0; 1];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![1.0]);
    }
}
