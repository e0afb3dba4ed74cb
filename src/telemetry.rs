//! Speaking and volume signals for UI feedback
//!
//! Two producers write here on different schedules: the capture pipeline sets
//! `is_user_speaking` once per frame, and the sampler sets volume and
//! `is_model_speaking` on a ~60Hz tick from the playback output. All fields
//! are atomics so readers never block either producer.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{average_level, FrequencyAnalyser, Mixer};

/// Average spectrum level above which the model counts as speaking.
pub const MODEL_SPEAKING_THRESHOLD: f32 = 10.0;

/// Default sampling period (~60fps)
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// Latest signal values, as exposed to collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySignal {
    /// 0..=100
    pub volume: u8,
    pub is_user_speaking: bool,
    pub is_model_speaking: bool,
}

#[derive(Debug, Default)]
pub struct SessionSignals {
    user_speaking: AtomicBool,
    model_speaking: AtomicBool,
    volume: AtomicU8,
}

impl SessionSignals {
    pub fn set_user_speaking(&self, speaking: bool) {
        self.user_speaking.store(speaking, Ordering::Relaxed);
    }

    pub fn set_model_speaking(&self, speaking: bool) {
        self.model_speaking.store(speaking, Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySignal {
        TelemetrySignal {
            volume: self.volume.load(Ordering::Relaxed),
            is_user_speaking: self.user_speaking.load(Ordering::Relaxed),
            is_model_speaking: self.model_speaking.load(Ordering::Relaxed),
        }
    }

    /// Back to neutral: nobody speaking, zero volume.
    pub fn reset(&self) {
        self.user_speaking.store(false, Ordering::Relaxed);
        self.model_speaking.store(false, Ordering::Relaxed);
        self.volume.store(0, Ordering::Relaxed);
    }
}

/// Map an average spectrum level to a 0..=100 volume.
pub fn volume_level(average: f32) -> u8 {
    if !average.is_finite() || average <= 0.0 {
        return 0;
    }
    (average * 2.0).min(100.0) as u8
}

/// Periodically analyses the playback output.
pub struct TelemetrySampler {
    mixer: Arc<Mixer>,
    analyser: FrequencyAnalyser,
    signals: Arc<SessionSignals>,
    period: Duration,
}

impl TelemetrySampler {
    pub fn new(mixer: Arc<Mixer>, signals: Arc<SessionSignals>, period: Duration) -> Self {
        Self {
            mixer,
            analyser: FrequencyAnalyser::new(),
            signals,
            period: if period.is_zero() {
                DEFAULT_SAMPLE_INTERVAL
            } else {
                period
            },
        }
    }

    /// Take one sample and publish it.
    pub fn sample(&mut self) -> TelemetrySignal {
        let recent = self.mixer.recent_output(self.analyser.fft_size());
        let bins = self.analyser.byte_frequency_data(&recent);
        let average = average_level(&bins);

        self.signals.set_volume(volume_level(average));
        self.signals
            .set_model_speaking(average > MODEL_SPEAKING_THRESHOLD);
        self.signals.snapshot()
    }

    /// Run the sampling loop until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            log::debug!("Telemetry sampler started ({:?} period)", self.period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        self.sample();
                    }
                }
            }

            log::debug!("Telemetry sampler stopped");
        })
    }
}
