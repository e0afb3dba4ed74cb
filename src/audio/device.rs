//! Audio device access
//!
//! Sessions acquire a microphone and a speaker through [`AudioDevices`]. The
//! real implementation uses CPAL; each stream lives on its own thread because
//! `cpal::Stream` is not `Send` on every platform. Closing (or dropping) a
//! handle stops the stream and joins the thread, which is what releases the
//! device.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, FromSample, PlayStreamError, Sample, SampleFormat, SampleRate, SizedSample,
    Stream, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange,
};
use tokio::sync::mpsc;

use super::mixer::{Mixer, VoiceId};
use super::AudioError;

/// An open device stream.
pub trait DeviceHandle: Send {
    /// Rate the device actually runs at.
    fn sample_rate(&self) -> u32;

    /// Stop the stream and release the device.
    fn close(self: Box<Self>);
}

/// An open output device and the mixer feeding it.
pub struct Speaker {
    pub mixer: Arc<Mixer>,
    /// Voices that finished playing naturally
    pub ended: mpsc::UnboundedReceiver<VoiceId>,
    pub handle: Box<dyn DeviceHandle>,
}

/// Source of microphone and speaker streams.
pub trait AudioDevices: Send + Sync + 'static {
    /// Open the default microphone. Mono chunks at the device rate are sent on
    /// `samples`; chunks that do not fit are dropped.
    fn open_microphone(
        &self,
        preferred_rate: u32,
        samples: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn DeviceHandle>, AudioError>;

    /// Open the default output device with a fresh mixer.
    fn open_speaker(&self, preferred_rate: u32) -> Result<Speaker, AudioError>;
}

/// Default host devices via CPAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl AudioDevices for CpalDevices {
    fn open_microphone(
        &self,
        preferred_rate: u32,
        samples: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn DeviceHandle>, AudioError> {
        let (thread, ()) =
            StreamThread::spawn("mic", move || build_input(preferred_rate, samples))?;
        Ok(Box::new(thread))
    }

    fn open_speaker(&self, preferred_rate: u32) -> Result<Speaker, AudioError> {
        let (thread, (mixer, ended)) =
            StreamThread::spawn("speaker", move || build_output(preferred_rate))?;
        Ok(Speaker {
            mixer,
            ended,
            handle: Box::new(thread),
        })
    }
}

/// Owns the thread that keeps a CPAL stream alive.
struct StreamThread {
    label: &'static str,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<R, F>(label: &'static str, build: F) -> Result<(Self, R), AudioError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<(Stream, u32, R), AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(u32, R), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("callsim-{}", label))
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, rate, extra)) => {
                        let _ = ready_tx.send(Ok((rate, extra)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until stopped or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Audio: {} stream released", label);
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let (sample_rate, extra) = ready_rx.recv().map_err(|_| {
            AudioError::StreamCreationFailed(format!("{} thread exited during setup", label))
        })??;

        Ok((
            Self {
                label,
                sample_rate,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
            extra,
        ))
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Audio: {} thread panicked", self.label);
            }
        }
    }
}

impl DeviceHandle for StreamThread {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supports_rate(range: &SupportedStreamConfigRange, rate: u32) -> bool {
    range.min_sample_rate() <= SampleRate(rate) && range.max_sample_rate() >= SampleRate(rate)
}

/// Prefer mono at the requested rate, then any channel count at that rate.
fn select_config(
    ranges: Vec<SupportedStreamConfigRange>,
    preferred_rate: u32,
) -> Option<SupportedStreamConfig> {
    ranges
        .iter()
        .find(|r| r.channels() == 1 && supports_rate(r, preferred_rate))
        .or_else(|| ranges.iter().find(|r| supports_rate(r, preferred_rate)))
        .cloned()
        .map(|r| r.with_sample_rate(SampleRate(preferred_rate)))
}

fn map_build_error(err: BuildStreamError) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceUnavailable("device disconnected".to_string())
        }
        BuildStreamError::BackendSpecific { err } => {
            if err.description.to_lowercase().contains("permission") {
                AudioError::PermissionDenied(err.description)
            } else {
                AudioError::StreamCreationFailed(err.description)
            }
        }
        other => AudioError::StreamCreationFailed(other.to_string()),
    }
}

fn map_play_error(err: PlayStreamError) -> AudioError {
    match err {
        PlayStreamError::DeviceNotAvailable => {
            AudioError::DeviceUnavailable("device disconnected".to_string())
        }
        other => AudioError::StreamCreationFailed(format!("Failed to start stream: {}", other)),
    }
}

fn build_input(
    preferred_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<(Stream, u32, ()), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .collect();
    let supported = match select_config(ranges, preferred_rate) {
        Some(c) => c,
        None => device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?,
    };

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, tx),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, tx),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, tx),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(map_play_error)?;
    Ok((stream, config.sample_rate.0, ()))
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>()
                            / frame.len() as f32
                    })
                    .collect();
                // Full or closed: the chunk is dropped
                let _ = tx.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

type SpeakerParts = (Arc<Mixer>, mpsc::UnboundedReceiver<VoiceId>);

fn build_output(preferred_rate: u32) -> Result<(Stream, u32, SpeakerParts), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .collect();
    let supported = match select_config(ranges, preferred_rate) {
        Some(c) => c,
        None => device
            .default_output_config()
            .map_err(|_| AudioError::NoSupportedConfig)?,
    };

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let (mixer, ended) = Mixer::new(config.sample_rate.0);

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, mixer.clone()),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, mixer.clone()),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, mixer.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(map_play_error)?;
    Ok((stream, config.sample_rate.0, (mixer, ended)))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err| log::error!("Audio output stream error: {}", err);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                scratch.resize(data.len(), 0.0);
                mixer.render(&mut scratch, channels);
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            err_fn,
            None,
        )
        .map_err(map_build_error)
}
