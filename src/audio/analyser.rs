//! Frequency analyser for the playback signal
//!
//! Produces byte-scaled magnitude spectra the way a browser `AnalyserNode`
//! does: Blackman window, FFT, per-bin exponential smoothing over time, then a
//! decibel range mapped onto 0..=255.

use std::sync::Arc;

use rustfft::{num_complex::Complex, FftPlanner};

/// FFT size used for output analysis (128 frequency bins).
pub const ANALYSER_FFT_SIZE: usize = 256;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct FrequencyAnalyser {
    fft_size: usize,
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: Vec<f32>,
    /// Smoothed linear magnitudes, one per bin
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl FrequencyAnalyser {
    pub fn new() -> Self {
        Self::with_fft_size(ANALYSER_FFT_SIZE)
    }

    /// `fft_size` should be a power of two.
    pub fn with_fft_size(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let n = fft_size as f32;
        let window: Vec<f32> = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft_size,
            fft,
            window,
            smoothed: vec![0.0; fft_size / 2],
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Forget smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Analyse the most recent `fft_size` samples of `time_domain` (zero
    /// padded at the front when shorter) and return one byte per bin.
    pub fn byte_frequency_data(&mut self, time_domain: &[f32]) -> Vec<u8> {
        let take = time_domain.len().min(self.fft_size);
        let offset = self.fft_size - take;
        let recent = &time_domain[time_domain.len() - take..];

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { recent[i - offset] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;

        self.smoothed
            .iter_mut()
            .zip(self.buffer.iter())
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * scale;
                *smoothed = SMOOTHING_TIME_CONSTANT * *smoothed
                    + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
                if !smoothed.is_finite() {
                    *smoothed = 0.0;
                }
                if *smoothed <= 0.0 {
                    return 0;
                }
                let db = 20.0 * smoothed.log10();
                let scaled = (255.0 / range) * (db - MIN_DECIBELS);
                scaled.floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

impl Default for FrequencyAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean of a byte spectrum.
pub fn average_level(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn test_silence_reads_zero() {
        let mut analyser = FrequencyAnalyser::new();
        let bins = analyser.byte_frequency_data(&[0.0; 512]);
        assert_eq!(bins.len(), 128);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_raises_level() {
        let mut analyser = FrequencyAnalyser::new();
        let tone = sine(1000.0, 24_000.0, 0.5, 256);
        let first = average_level(&analyser.byte_frequency_data(&tone));
        assert!(first > 0.0);

        // Smoothing needs a few frames to settle on a steady tone
        let mut bins = analyser.byte_frequency_data(&tone);
        for _ in 0..3 {
            bins = analyser.byte_frequency_data(&tone);
        }
        assert!(average_level(&bins) > first);
        assert!(average_level(&bins) > 10.0);
        // 1kHz sits near bin 10 at 93.75Hz per bin
        assert_eq!(bins[10], 255);
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyser = FrequencyAnalyser::new();
        let tone = sine(1000.0, 24_000.0, 0.5, 256);
        analyser.byte_frequency_data(&tone);
        let loud = average_level(&analyser.byte_frequency_data(&tone));
        let after = average_level(&analyser.byte_frequency_data(&[0.0; 256]));
        assert!(after > 0.0);
        assert!(after <= loud);

        analyser.reset();
        let cleared = average_level(&analyser.byte_frequency_data(&[0.0; 256]));
        assert_eq!(cleared, 0.0);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let mut analyser = FrequencyAnalyser::new();
        let bins = analyser.byte_frequency_data(&[0.0; 10]);
        assert_eq!(bins.len(), analyser.bin_count());
    }
}
