//! Microphone capture pipeline
//!
//! Raw device chunks arrive on a channel in whatever size the driver picks.
//! The pipeline task resamples them to the service input rate, assembles
//! fixed-size frames and drops them until a transport is attached. After
//! that it flags voice activity from frame RMS, encodes each frame and
//! forwards it.
//!
//! ```text
//! cpal callback ──▶ mpsc<Vec<f32>> ──▶ StreamResampler ──▶ FrameAssembler
//!                                                              │
//!                                      isUserSpeaking ◀── RMS ─┤
//!                                                              ▼
//!                                             encode ──▶ transport (if attached)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::codec::{encode_frame, EncodedFrame};
use super::resample::StreamResampler;
use super::{AudioError, CAPTURE_FRAME_SIZE, INPUT_SAMPLE_RATE};
use crate::telemetry::SessionSignals;

/// A frame is speech when its RMS is strictly above this level.
pub const SPEECH_RMS_THRESHOLD: f32 = 0.02;

/// Root-mean-square energy of a frame.
pub fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / frame.len() as f64).sqrt() as f32
}

pub fn is_speech(rms: f32) -> bool {
    rms > SPEECH_RMS_THRESHOLD
}

/// Splits an arbitrary-sized sample stream into fixed frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples and return every frame that is now complete, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_size;
        if complete == 0 {
            return Vec::new();
        }

        let rest = self.pending.split_off(complete * self.frame_size);
        let full = std::mem::replace(&mut self.pending, rest);
        full.chunks_exact(self.frame_size)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Samples waiting for the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate the microphone actually runs at
    pub source_rate: u32,
    /// Rate frames are encoded at
    pub target_rate: u32,
    /// Samples per encoded frame
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source_rate: INPUT_SAMPLE_RATE,
            target_rate: INPUT_SAMPLE_RATE,
            frame_size: CAPTURE_FRAME_SIZE,
        }
    }
}

/// Frame counters shared with the session for metrics.
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureStats {
    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle to a running capture pipeline. Dropping it stops the task.
pub struct CaptureHandle {
    outbound: Arc<OnceLock<mpsc::Sender<EncodedFrame>>>,
    stats: Arc<CaptureStats>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Start forwarding frames to the transport. Returns false if a transport
    /// was already attached.
    pub fn attach(&self, outbound: mpsc::Sender<EncodedFrame>) -> bool {
        self.outbound.set(outbound).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.get().is_some()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// Stop the pipeline and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Capture: pipeline task failed: {}", e);
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the capture pipeline over a channel of raw mono device chunks.
pub fn spawn_capture(
    mut raw_rx: mpsc::Receiver<Vec<f32>>,
    config: CaptureConfig,
    signals: Arc<SessionSignals>,
) -> Result<CaptureHandle, AudioError> {
    let mut resampler = StreamResampler::new(config.source_rate, config.target_rate)
        .map_err(AudioError::StreamCreationFailed)?;
    let mut assembler = FrameAssembler::new(config.frame_size);

    let outbound: Arc<OnceLock<mpsc::Sender<EncodedFrame>>> = Arc::new(OnceLock::new());
    let stats = Arc::new(CaptureStats::default());
    let cancel = CancellationToken::new();

    log::info!(
        "Capture: starting pipeline ({} Hz -> {} Hz, {} samples/frame)",
        config.source_rate,
        config.target_rate,
        config.frame_size
    );

    let task = {
        let outbound = outbound.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        let target_rate = config.target_rate;

        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = raw_rx.recv() => chunk,
                };
                let Some(chunk) = chunk else {
                    log::debug!("Capture: device channel closed");
                    break;
                };

                let samples = match resampler.push(&chunk) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("Capture: {}", e);
                        continue;
                    }
                };

                for frame in assembler.push(&samples) {
                    forward_frame(&frame, target_rate, &outbound, &stats, &signals);
                }
            }
            log::info!(
                "Capture: pipeline stopped ({} captured, {} sent, {} dropped)",
                stats.frames_captured(),
                stats.frames_sent(),
                stats.frames_dropped()
            );
        })
    };

    Ok(CaptureHandle {
        outbound,
        stats,
        cancel,
        task: Some(task),
    })
}

fn forward_frame(
    frame: &[f32],
    sample_rate: u32,
    outbound: &OnceLock<mpsc::Sender<EncodedFrame>>,
    stats: &CaptureStats,
    signals: &SessionSignals,
) {
    stats.captured.fetch_add(1, Ordering::Relaxed);

    // Nothing is measured until the transport is live
    let Some(tx) = outbound.get() else {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };
    signals.set_user_speaking(is_speech(frame_rms(frame)));

    match tx.try_send(encode_frame(frame, sample_rate)) {
        Ok(()) => {
            stats.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Capture: outbound queue full, dropping frame");
        }
        Err(TrySendError::Closed(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
