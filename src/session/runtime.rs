//! Session loop and effect execution
//!
//! The loop owns every session resource. Effects run inline, except for the
//! connection attempt, which is spawned so that a slow device or service
//! never blocks `disconnect()`. Its result comes back through the loop
//! channel tagged with the attempt's session id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::metrics::{SessionMetrics, SessionTracker};
use super::state_machine::{reduce, Effect, EndReason, Event, State};
use super::{SessionConfig, SessionError, SessionOptions, SessionStatus};
use crate::audio::{
    parse_pcm_rate, spawn_capture, AudioBuffer, AudioDevices, CaptureConfig, CaptureHandle,
    DeviceHandle, InboundDecoder, Mixer, Speaker, VoiceId,
};
use crate::live::{AudioChunk, InboundEvent, LiveLink, LiveTransport, SessionSetup};
use crate::playback::PlaybackScheduler;
use crate::telemetry::{SessionSignals, TelemetrySampler};
use crate::transcript::LogSender;

/// Raw microphone chunks buffered between the device callback and capture
const RAW_CHUNK_QUEUE: usize = 64;

pub(crate) enum LoopInput {
    Event(Event),
    /// A connection attempt finished; the loop takes ownership of its resources
    Opened { id: Uuid, connection: Connection },
}

/// Resources acquired by a successful connection attempt.
pub(crate) struct Connection {
    link: LiveLink,
    speaker: Speaker,
    microphone: Box<dyn DeviceHandle>,
    capture: CaptureHandle,
}

/// Everything a CONNECTED session holds.
struct ActiveSession {
    link: LiveLink,
    mixer: Arc<Mixer>,
    speaker: Box<dyn DeviceHandle>,
    microphone: Box<dyn DeviceHandle>,
    capture: CaptureHandle,
    scheduler: PlaybackScheduler,
    decoder: InboundDecoder,
    /// Stops the forwarders and the telemetry sampler
    tasks: CancellationToken,
    telemetry: tokio::task::JoinHandle<()>,
    tracker: SessionTracker,
}

impl ActiveSession {
    fn schedule(&mut self, buffer: AudioBuffer) {
        if buffer.is_empty() {
            log::debug!("Session: skipping empty audio buffer");
            return;
        }
        match self.scheduler.schedule(buffer) {
            Ok(scheduled) => self.tracker.chunk_played(scheduled.duration),
            Err(e) => log::warn!("Session: could not schedule audio: {}", e),
        }
    }
}

pub(crate) struct SessionRuntime {
    transport: Arc<dyn LiveTransport>,
    devices: Arc<dyn AudioDevices>,
    options: SessionOptions,
    signals: Arc<SessionSignals>,
    log_tx: LogSender,
    status_tx: watch::Sender<SessionStatus>,
    metrics: Arc<Mutex<Option<SessionMetrics>>>,
    tx: mpsc::UnboundedSender<LoopInput>,
    /// Connection attempt in progress
    pending: Option<(Uuid, CancellationToken)>,
    /// Opened connections waiting for their Activate/Release effect
    opened: HashMap<Uuid, Connection>,
    active: Option<ActiveSession>,
}

impl SessionRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn LiveTransport>,
        devices: Arc<dyn AudioDevices>,
        options: SessionOptions,
        signals: Arc<SessionSignals>,
        log_tx: LogSender,
        status_tx: watch::Sender<SessionStatus>,
        metrics: Arc<Mutex<Option<SessionMetrics>>>,
        tx: mpsc::UnboundedSender<LoopInput>,
    ) -> Self {
        Self {
            transport,
            devices,
            options,
            signals,
            log_tx,
            status_tx,
            metrics,
            tx,
            pending: None,
            opened: HashMap::new(),
            active: None,
        }
    }

    /// Run the session loop until `Exit` or until every sender is gone.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopInput>) {
        let mut state = State::default();

        self.emit_status(&state);
        log::info!("Session loop started");

        while let Some(input) = rx.recv().await {
            let event = match input {
                LoopInput::Event(event) => event,
                LoopInput::Opened { id, connection } => {
                    self.opened.insert(id, connection);
                    Event::Opened { id }
                }
            };

            // Audio payloads are too large to log
            if !matches!(event, Event::Inbound { .. } | Event::PlaybackEnded { .. }) {
                log::debug!("Received event: {:?}", event);
            }

            // Handle Exit at the edge
            if matches!(event, Event::Exit) {
                log::info!("Exit requested, shutting down session loop");
                break;
            }

            let old_discriminant = std::mem::discriminant(&state);
            let (next, effects) = reduce(&state, event);
            let new_discriminant = std::mem::discriminant(&next);

            // Log state transitions
            if old_discriminant != new_discriminant {
                log::info!("State transition: {:?} -> {:?}", state, next);
            }

            state = next;

            for eff in effects {
                self.execute(eff, &state).await;
            }
        }

        self.teardown(EndReason::Shutdown).await;
        if !matches!(state, State::Disconnected) {
            self.emit_status(&State::Disconnected);
        }
        log::info!("Session loop ended");
    }

    async fn execute(&mut self, effect: Effect, state: &State) {
        match effect {
            Effect::Open { id, config } => self.open(id, config),
            Effect::Activate { id } => self.activate(id),
            Effect::Release { id } => {
                if let Some(connection) = self.opened.remove(&id) {
                    log::info!("Session: releasing late connection {}", id);
                    release_connection(connection).await;
                }
            }
            Effect::Play { chunk } => self.play(chunk),
            Effect::Flush => {
                if let Some(active) = self.active.as_mut() {
                    let flushed = active.scheduler.flush();
                    active.decoder.reset();
                    active.tracker.interrupted(flushed);
                    log::info!("Session: interruption, {} buffers halted", flushed);
                }
            }
            Effect::FinishTurn => {
                if let Some(active) = self.active.as_mut() {
                    match active.decoder.finish_turn() {
                        Ok(tail) => active.schedule(tail),
                        Err(e) => log::warn!("Session: could not finish turn audio: {}", e),
                    }
                }
            }
            Effect::Retire { voice } => {
                if let Some(active) = self.active.as_mut() {
                    active.scheduler.handle_ended(voice);
                }
            }
            Effect::Log(event) => {
                if let Some(active) = self.active.as_mut() {
                    active.tracker.transcript_event();
                }
                log::info!("Transcript [{}]: {}", event.role, event.text);
                // Consumer may have gone away; the session keeps running
                let _ = self.log_tx.send(event);
            }
            Effect::Teardown { reason } => self.teardown(reason).await,
            Effect::EmitStatus => self.emit_status(state),
        }
    }

    fn emit_status(&self, state: &State) {
        self.status_tx.send_replace(SessionStatus::from(state));
    }

    // -----------------
    // Connection attempt
    // -----------------

    fn open(&mut self, id: Uuid, config: SessionConfig) {
        let cancel = CancellationToken::new();
        if let Some((old_id, old_cancel)) = self.pending.replace((id, cancel.clone())) {
            log::warn!("Session: abandoning connection attempt {}", old_id);
            old_cancel.cancel();
        }

        let transport = self.transport.clone();
        let devices = self.devices.clone();
        let options = self.options.clone();
        let signals = self.signals.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            log::info!("Session {}: opening devices and transport", id);
            match open_connection(transport, devices, config, options, signals, &cancel).await {
                Ok(Some(connection)) => {
                    if tx.send(LoopInput::Opened { id, connection }).is_err() {
                        log::debug!("Session {}: loop gone, dropping connection", id);
                    }
                }
                Ok(None) => {
                    log::info!("Session {}: connection attempt cancelled", id);
                }
                Err(error) => {
                    log::error!("Session {}: connection failed: {}", id, error);
                    let _ = tx.send(LoopInput::Event(Event::OpenFailed { id, error }));
                }
            }
        });
    }

    fn activate(&mut self, id: Uuid) {
        let Some(connection) = self.opened.remove(&id) else {
            log::warn!("Session {}: no opened connection to activate", id);
            return;
        };
        if matches!(&self.pending, Some((pending_id, _)) if *pending_id == id) {
            self.pending = None;
        }

        let Connection {
            mut link,
            speaker,
            microphone,
            capture,
        } = connection;
        let Speaker {
            mixer,
            ended,
            handle,
        } = speaker;

        capture.attach(link.outbound());

        let tasks = CancellationToken::new();
        match link.take_inbound() {
            Some(inbound) => {
                tokio::spawn(forward_inbound(id, inbound, self.tx.clone(), tasks.clone()));
            }
            None => log::warn!("Session {}: inbound stream already taken", id),
        }
        tokio::spawn(forward_ended(id, ended, self.tx.clone(), tasks.clone()));

        let telemetry = TelemetrySampler::new(
            mixer.clone(),
            self.signals.clone(),
            self.options.telemetry_interval,
        )
        .spawn(tasks.clone());

        self.active = Some(ActiveSession {
            link,
            scheduler: PlaybackScheduler::new(mixer.clone()),
            decoder: InboundDecoder::new(mixer.sample_rate()),
            mixer,
            speaker: handle,
            microphone,
            capture,
            tasks,
            telemetry,
            tracker: SessionTracker::new(id),
        });

        log::info!("Session {}: live", id);
    }

    // -----------------
    // Playback
    // -----------------

    fn play(&mut self, chunk: AudioChunk) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let source_rate =
            parse_pcm_rate(&chunk.mime_type).unwrap_or(self.options.output_sample_rate);

        match active.decoder.decode(&chunk.data, source_rate) {
            Ok(buffer) => active.schedule(buffer),
            Err(e) => {
                log::warn!("Session: dropping malformed audio chunk: {}", e);
                active.tracker.decode_failed();
            }
        }
    }

    // -----------------
    // Teardown
    // -----------------

    async fn teardown(&mut self, reason: EndReason) {
        if let Some((id, cancel)) = self.pending.take() {
            log::info!("Session {}: cancelling connection attempt", id);
            cancel.cancel();
        }

        for (id, connection) in self.opened.drain().collect::<Vec<_>>() {
            log::debug!("Session {}: releasing unactivated connection", id);
            release_connection(connection).await;
        }

        if let Some(mut active) = self.active.take() {
            let session_id = active.tracker.session_id();
            log::info!("Session {}: tearing down ({})", session_id, reason.as_str());

            active.tasks.cancel();

            let flushed = active.scheduler.flush();
            active.tracker.flushed(flushed);
            active.mixer.close();

            let capture_stats = active.capture.stats();
            active.capture.stop().await;
            active.link.close();
            close_devices(active.microphone, active.speaker).await;

            if let Err(e) = active.telemetry.await {
                log::warn!("Session {}: telemetry task failed: {}", session_id, e);
            }

            let metrics = active.tracker.finish(Some(&capture_stats), reason.as_str());
            *self
                .metrics
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(metrics);
        }

        self.signals.reset();
    }
}

/// Acquire speaker, microphone and transport for one session.
///
/// Returns `Ok(None)` if `cancel` fires first. Anything acquired before a
/// failure or cancellation is released by drop.
async fn open_connection(
    transport: Arc<dyn LiveTransport>,
    devices: Arc<dyn AudioDevices>,
    config: SessionConfig,
    options: SessionOptions,
    signals: Arc<SessionSignals>,
    cancel: &CancellationToken,
) -> Result<Option<Connection>, SessionError> {
    let input_rate = options.input_sample_rate;
    let output_rate = options.output_sample_rate;

    // Device setup blocks on the stream threads
    let (speaker, microphone, raw_rx) = tokio::task::spawn_blocking(move || {
        let speaker = devices
            .open_speaker(output_rate)
            .map_err(SessionError::Speaker)?;
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHUNK_QUEUE);
        let microphone = devices
            .open_microphone(input_rate, raw_tx)
            .map_err(SessionError::Microphone)?;
        Ok::<_, SessionError>((speaker, microphone, raw_rx))
    })
    .await
    .map_err(|e| SessionError::Internal(format!("device setup task failed: {}", e)))??;

    if cancel.is_cancelled() {
        close_devices(microphone, speaker.handle).await;
        return Ok(None);
    }

    let capture = spawn_capture(
        raw_rx,
        CaptureConfig {
            source_rate: microphone.sample_rate(),
            target_rate: input_rate,
            frame_size: options.capture_frame_size,
        },
        signals,
    );
    let capture = match capture {
        Ok(capture) => capture,
        Err(e) => {
            close_devices(microphone, speaker.handle).await;
            return Err(SessionError::Microphone(e));
        }
    };

    let setup = SessionSetup::conversation(config.system_prompt, config.voice);
    let opened = tokio::select! {
        _ = cancel.cancelled() => None,
        result = transport.open(setup) => Some(result),
    };

    match opened {
        Some(Ok(link)) => Ok(Some(Connection {
            link,
            speaker,
            microphone,
            capture,
        })),
        Some(Err(e)) => {
            capture.stop().await;
            close_devices(microphone, speaker.handle).await;
            Err(SessionError::Transport(e))
        }
        None => {
            capture.stop().await;
            close_devices(microphone, speaker.handle).await;
            Ok(None)
        }
    }
}

async fn release_connection(connection: Connection) {
    let Connection {
        link,
        speaker,
        microphone,
        capture,
    } = connection;
    speaker.mixer.close();
    capture.stop().await;
    link.close();
    close_devices(microphone, speaker.handle).await;
}

/// Stop both streams off the async workers; closing joins the stream threads.
async fn close_devices(microphone: Box<dyn DeviceHandle>, speaker: Box<dyn DeviceHandle>) {
    let closed = tokio::task::spawn_blocking(move || {
        microphone.close();
        speaker.close();
    })
    .await;
    if let Err(e) = closed {
        log::error!("Session: device close task failed: {}", e);
    }
}

/// Feed transport events into the loop, one at a time, in arrival order.
async fn forward_inbound(
    id: Uuid,
    mut inbound: mpsc::Receiver<InboundEvent>,
    tx: mpsc::UnboundedSender<LoopInput>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = inbound.recv() => next,
        };

        let (event, last) = match next {
            Some(InboundEvent::Message(message)) => (Event::Inbound { id, message }, false),
            Some(InboundEvent::Closed) | None => (Event::TransportClosed { id }, true),
            Some(InboundEvent::Error(reason)) => (Event::TransportFailed { id, reason }, true),
        };

        if tx.send(LoopInput::Event(event)).is_err() || last {
            return;
        }
    }
}

/// Report buffers that finished playing on their own.
async fn forward_ended(
    id: Uuid,
    mut ended: mpsc::UnboundedReceiver<VoiceId>,
    tx: mpsc::UnboundedSender<LoopInput>,
    cancel: CancellationToken,
) {
    loop {
        let voice = tokio::select! {
            _ = cancel.cancelled() => return,
            voice = ended.recv() => voice,
        };
        let Some(voice) = voice else {
            return;
        };
        if tx
            .send(LoopInput::Event(Event::PlaybackEnded { id, voice }))
            .is_err()
        {
            return;
        }
    }
}
