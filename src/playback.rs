//! Gapless playback scheduling
//!
//! Decoded buffers are chained on the mixer timeline: each one starts at
//! `max(next_start, sink_now)` and pushes `next_start` to its own end. The
//! scheduler is owned by the session loop, so arrivals and flushes are
//! serialized and need no locking of their own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::audio::{AudioBuffer, Mixer, SinkError, VoiceId};

/// A buffer submitted to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub voice: VoiceId,
    /// Sink time in seconds at which playback begins
    pub start: f64,
    /// Length in seconds
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    mixer: Arc<Mixer>,
    /// Next start time; zero means "as soon as possible"
    next_start: f64,
    in_flight: HashMap<VoiceId, ScheduledBuffer>,
}

impl PlaybackScheduler {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        Self {
            mixer,
            next_start: 0.0,
            in_flight: HashMap::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    /// Queue a buffer directly after everything already scheduled.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Result<ScheduledBuffer, SinkError> {
        if buffer.sample_rate != self.mixer.sample_rate() {
            return Err(SinkError::RateMismatch {
                expected: self.mixer.sample_rate(),
                actual: buffer.sample_rate,
            });
        }

        let duration = buffer.duration();
        let start = self.next_start.max(self.mixer.current_time());
        let voice = self.mixer.start_at(buffer.into_samples(), start)?;

        let scheduled = ScheduledBuffer {
            voice,
            start,
            duration,
        };
        self.next_start = scheduled.end();
        self.in_flight.insert(voice, scheduled);

        log::debug!(
            "Playback: voice {} at {:.3}s for {:.3}s ({} in flight)",
            voice,
            start,
            duration,
            self.in_flight.len()
        );
        Ok(scheduled)
    }

    /// Halt everything in flight and reset the clock. Returns how many
    /// buffers were cut off.
    pub fn flush(&mut self) -> usize {
        let count = self.in_flight.len();
        for (voice, _) in self.in_flight.drain() {
            // Already-finished voices report UnknownVoice; nothing to do
            let _ = self.mixer.stop(voice);
        }
        self.next_start = 0.0;
        if count > 0 {
            log::debug!("Playback: flushed {} buffers", count);
        }
        count
    }

    /// Forget a voice the sink reports as finished.
    pub fn handle_ended(&mut self, voice: VoiceId) -> Option<ScheduledBuffer> {
        self.in_flight.remove(&voice)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 1000;

    fn buffer(len: usize) -> AudioBuffer {
        AudioBuffer::new(vec![0.1; len], RATE)
    }

    fn advance(mixer: &Mixer, frames: usize) {
        let mut out = vec![0.0; frames];
        mixer.render(&mut out, 1);
    }

    #[test]
    fn test_buffers_chain_without_gap_or_overlap() {
        let (mixer, _ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer);

        let mut previous: Option<ScheduledBuffer> = None;
        for len in [100, 250, 80, 400] {
            let scheduled = scheduler.schedule(buffer(len)).unwrap();
            if let Some(prev) = previous {
                assert!(scheduled.start >= prev.start);
                assert!((scheduled.start - prev.end()).abs() < 1e-9);
            }
            previous = Some(scheduled);
        }
        assert!((scheduler.next_start() - 0.83).abs() < 1e-9);
        assert_eq!(scheduler.in_flight(), 4);
    }

    #[test]
    fn test_late_arrival_starts_at_sink_time() {
        let (mixer, _ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer.clone());

        scheduler.schedule(buffer(100)).unwrap();
        advance(&mixer, 300);

        let scheduled = scheduler.schedule(buffer(100)).unwrap();
        assert!((scheduled.start - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_flush_clears_in_flight_and_resets_clock() {
        let (mixer, _ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer.clone());

        scheduler.schedule(buffer(500)).unwrap();
        scheduler.schedule(buffer(500)).unwrap();
        advance(&mixer, 200);

        assert_eq!(scheduler.flush(), 2);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.next_start(), 0.0);
        assert_eq!(mixer.active_voices(), 0);

        // Next buffer starts now, not after the discarded turn
        let scheduled = scheduler.schedule(buffer(100)).unwrap();
        assert!((scheduled.start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_flush_ignores_already_finished_voices() {
        let (mixer, _ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer.clone());

        scheduler.schedule(buffer(10)).unwrap();
        advance(&mixer, 50);
        // The ended notification has not been processed yet
        assert_eq!(scheduler.in_flight(), 1);
        assert_eq!(scheduler.flush(), 1);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_natural_completion_is_removed() {
        let (mixer, mut ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer.clone());

        let scheduled = scheduler.schedule(buffer(10)).unwrap();
        advance(&mixer, 20);
        let voice = ended.try_recv().unwrap();
        assert_eq!(voice, scheduled.voice);
        assert_eq!(scheduler.handle_ended(voice), Some(scheduled));
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.handle_ended(voice), None);
    }

    #[test]
    fn test_rate_mismatch_is_rejected() {
        let (mixer, _ended) = Mixer::new(RATE);
        let mut scheduler = PlaybackScheduler::new(mixer);
        let err = scheduler
            .schedule(AudioBuffer::new(vec![0.0; 10], 24_000))
            .unwrap_err();
        assert_eq!(
            err,
            SinkError::RateMismatch {
                expected: RATE,
                actual: 24_000
            }
        );
        assert_eq!(scheduler.in_flight(), 0);
    }
}
