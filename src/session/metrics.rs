//! Per-session metrics
//!
//! Counts what happened during one connected session: audio played,
//! interruptions, frames sent upstream, decode failures. A summary is kept
//! after teardown for diagnostics.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::CaptureStats;

/// Metrics for one finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Unique identifier for this session
    pub session_id: String,
    /// Unix timestamp when the session went live (seconds)
    pub started_at: u64,
    /// Time connected in milliseconds
    pub connected_ms: u64,
    /// Audio chunks scheduled for playback
    pub chunks_played: u64,
    /// Total scheduled audio in milliseconds
    pub audio_played_ms: u64,
    /// Times the service reported an interruption
    pub interruptions: u64,
    /// Buffers cut short by an interruption or teardown
    pub buffers_flushed: u64,
    /// Inbound audio chunks that failed to decode
    pub decode_errors: u64,
    /// Transcript entries published while connected
    pub transcript_events: u64,
    /// Microphone frames handed to the transport
    pub frames_sent: u64,
    /// Microphone frames dropped (transport not ready or queue full)
    pub frames_dropped: u64,
    /// How the session ended
    pub end_reason: String,
}

/// Tracks a session while it is live
pub struct SessionTracker {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    chunks_played: u64,
    audio_played: Duration,
    interruptions: u64,
    buffers_flushed: u64,
    decode_errors: u64,
    transcript_events: u64,
}

impl SessionTracker {
    pub fn new(session_id: Uuid) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: now,
            chunks_played: 0,
            audio_played: Duration::ZERO,
            interruptions: 0,
            buffers_flushed: 0,
            decode_errors: 0,
            transcript_events: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn chunk_played(&mut self, duration_secs: f64) {
        self.chunks_played += 1;
        if duration_secs.is_finite() && duration_secs > 0.0 {
            self.audio_played += Duration::from_secs_f64(duration_secs);
        }
    }

    pub fn interrupted(&mut self, flushed: usize) {
        self.interruptions += 1;
        self.buffers_flushed += flushed as u64;
    }

    pub fn flushed(&mut self, flushed: usize) {
        self.buffers_flushed += flushed as u64;
    }

    pub fn decode_failed(&mut self) {
        self.decode_errors += 1;
    }

    pub fn transcript_event(&mut self) {
        self.transcript_events += 1;
    }

    /// Close out the session
    pub fn finish(self, capture: Option<&CaptureStats>, end_reason: &str) -> SessionMetrics {
        let metrics = SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            connected_ms: self.started_at.elapsed().as_millis() as u64,
            chunks_played: self.chunks_played,
            audio_played_ms: self.audio_played.as_millis() as u64,
            interruptions: self.interruptions,
            buffers_flushed: self.buffers_flushed,
            decode_errors: self.decode_errors,
            transcript_events: self.transcript_events,
            frames_sent: capture.map(|c| c.frames_sent()).unwrap_or(0),
            frames_dropped: capture.map(|c| c.frames_dropped()).unwrap_or(0),
            end_reason: end_reason.to_string(),
        };

        log::info!(
            "Metrics: session {} ended ({}): {}ms connected, {} chunks played, {} interruptions, {} frames sent, {} dropped",
            metrics.session_id,
            metrics.end_reason,
            metrics.connected_ms,
            metrics.chunks_played,
            metrics.interruptions,
            metrics.frames_sent,
            metrics.frames_dropped
        );

        metrics
    }
}
