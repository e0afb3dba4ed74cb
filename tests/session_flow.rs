//! End-to-end session tests
//!
//! Drives `LiveSession` through a scripted transport and fake audio devices,
//! so no network or sound hardware is needed:
//!
//! ```bash
//! cargo test --test session_flow
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use callsim::audio::{
    encode_frame, AudioDevices, AudioError, DeviceHandle, EncodedFrame, Mixer, Speaker,
};
use callsim::live::{
    AudioChunk, InboundEvent, InboundMessage, LiveLink, LiveTransport, SessionSetup,
    TransportError,
};
use callsim::{
    LiveSession, LogEvent, LogReceiver, Role, SessionConfig, SessionOptions, SessionStatus,
    TelemetrySignal, Voice,
};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Fakes
// ============================================================================

/// Device handle that counts its release.
struct FakeHandle {
    rate: u32,
    released: Arc<AtomicUsize>,
}

impl DeviceHandle for FakeHandle {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn close(self: Box<Self>) {}
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeDevices {
    deny_microphone: bool,
    speaker_rate: Option<u32>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
    mixer: Mutex<Option<Arc<Mixer>>>,
    microphone: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
}

impl FakeDevices {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn denying_microphone() -> Arc<Self> {
        Arc::new(Self {
            deny_microphone: true,
            ..Self::default()
        })
    }

    /// A speaker that ignores the preferred rate, like hardware stuck at 48kHz.
    fn with_speaker_rate(rate: u32) -> Arc<Self> {
        Arc::new(Self {
            speaker_rate: Some(rate),
            ..Self::default()
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn mixer(&self) -> Arc<Mixer> {
        self.mixer.lock().unwrap().clone().expect("speaker not opened")
    }

    async fn speak(&self, samples: Vec<f32>) {
        let tx = self.microphone.lock().unwrap().clone().expect("mic not opened");
        tx.send(samples).await.unwrap();
    }

    fn handle(&self, rate: u32) -> Box<dyn DeviceHandle> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeHandle {
            rate,
            released: self.released.clone(),
        })
    }
}

impl AudioDevices for FakeDevices {
    fn open_microphone(
        &self,
        preferred_rate: u32,
        samples: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn DeviceHandle>, AudioError> {
        if self.deny_microphone {
            return Err(AudioError::PermissionDenied("Permission denied".to_string()));
        }
        *self.microphone.lock().unwrap() = Some(samples);
        Ok(self.handle(preferred_rate))
    }

    fn open_speaker(&self, preferred_rate: u32) -> Result<Speaker, AudioError> {
        let rate = self.speaker_rate.unwrap_or(preferred_rate);
        let (mixer, ended) = Mixer::new(rate);
        *self.mixer.lock().unwrap() = Some(mixer.clone());
        Ok(Speaker {
            mixer,
            ended,
            handle: self.handle(rate),
        })
    }
}

/// The service side of an open link.
struct Remote {
    inbound: mpsc::Sender<InboundEvent>,
    outbound: mpsc::Receiver<EncodedFrame>,
    shutdown: CancellationToken,
}

impl Remote {
    async fn send(&self, message: InboundMessage) {
        self.inbound
            .send(InboundEvent::Message(message))
            .await
            .unwrap();
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Accept,
    Refuse,
    Hang,
}

struct FakeTransport {
    behaviour: Behaviour,
    setups: Mutex<Vec<SessionSetup>>,
    remotes: mpsc::UnboundedSender<Remote>,
}

impl FakeTransport {
    fn new(behaviour: Behaviour) -> (Arc<Self>, mpsc::UnboundedReceiver<Remote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                behaviour,
                setups: Mutex::new(Vec::new()),
                remotes,
            }),
            rx,
        )
    }

    fn setups(&self) -> Vec<SessionSetup> {
        self.setups.lock().unwrap().clone()
    }
}

impl LiveTransport for FakeTransport {
    fn open(&self, setup: SessionSetup) -> BoxFuture<'static, Result<LiveLink, TransportError>> {
        self.setups.lock().unwrap().push(setup);
        let behaviour = self.behaviour;
        let remotes = self.remotes.clone();

        Box::pin(async move {
            match behaviour {
                Behaviour::Refuse => Err(TransportError::SetupRejected(
                    "API key not valid".to_string(),
                )),
                Behaviour::Hang => futures_util::future::pending().await,
                Behaviour::Accept => {
                    let (out_tx, out_rx) = mpsc::channel(32);
                    let (in_tx, in_rx) = mpsc::channel(100);
                    let shutdown = CancellationToken::new();
                    let _ = remotes.send(Remote {
                        inbound: in_tx,
                        outbound: out_rx,
                        shutdown: shutdown.clone(),
                    });
                    Ok(LiveLink::new(out_tx, in_rx, shutdown))
                }
            }
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn options() -> SessionOptions {
    SessionOptions {
        input_sample_rate: 16_000,
        output_sample_rate: 24_000,
        capture_frame_size: 160,
        telemetry_interval: Duration::from_millis(5),
    }
}

fn config() -> SessionConfig {
    SessionConfig::new("You are a reluctant prospect.", Voice::Fenrir)
}

async fn wait_for(status: &mut watch::Receiver<SessionStatus>, want: SessionStatus) {
    timeout(WAIT, status.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
        .expect("status channel closed");
}

async fn next_log(logs: &mut LogReceiver) -> LogEvent {
    timeout(WAIT, logs.recv())
        .await
        .expect("timed out waiting for log event")
        .expect("log channel closed")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Deterministic broadband signal
fn noise(len: usize) -> Vec<f32> {
    let mut seed: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

fn audio_chunk(seconds: f32) -> AudioChunk {
    let frame = encode_frame(&noise((24_000.0 * seconds) as usize), 24_000);
    AudioChunk {
        data: frame.data,
        mime_type: frame.mime_type,
    }
}

struct Harness {
    session: LiveSession,
    logs: LogReceiver,
    status: watch::Receiver<SessionStatus>,
    devices: Arc<FakeDevices>,
    transport: Arc<FakeTransport>,
    remotes: mpsc::UnboundedReceiver<Remote>,
}

fn start(behaviour: Behaviour, devices: Arc<FakeDevices>) -> Harness {
    let (transport, remotes) = FakeTransport::new(behaviour);
    let (session, logs) = LiveSession::start(transport.clone(), devices.clone(), options());
    let status = session.subscribe_status();
    Harness {
        session,
        logs,
        status,
        devices,
        transport,
        remotes,
    }
}

/// Connect and consume the "Connected" log entry.
async fn connect(h: &mut Harness) -> Remote {
    h.session.connect(config()).unwrap();
    wait_for(&mut h.status, SessionStatus::Connected).await;
    let remote = timeout(WAIT, h.remotes.recv())
        .await
        .expect("timed out waiting for link")
        .expect("transport dropped");
    let connected = next_log(&mut h.logs).await;
    assert_eq!(connected.role, Role::System);
    assert_eq!(connected.text, "Connected to Gemini Live");
    remote
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn hello_audio_interrupt_flushes_playback() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote
        .send(InboundMessage::InputTranscription("Hello".to_string()))
        .await;
    remote.send(InboundMessage::Audio(audio_chunk(0.5))).await;
    remote.send(InboundMessage::Interrupted).await;

    let user = next_log(&mut h.logs).await;
    assert_eq!(user.role, Role::User);
    assert_eq!(user.text, "Hello");

    let interrupted = next_log(&mut h.logs).await;
    assert_eq!(interrupted.role, Role::System);
    assert_eq!(interrupted.text, "Interruption detected");

    // Flush runs before the log entry is published
    assert_eq!(h.devices.mixer().active_voices(), 0);
    assert_eq!(h.session.status(), SessionStatus::Connected);

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;

    let metrics = h.session.last_metrics().expect("metrics recorded");
    assert_eq!(metrics.chunks_played, 1);
    assert_eq!(metrics.interruptions, 1);
    assert_eq!(metrics.buffers_flushed, 1);
    assert_eq!(metrics.audio_played_ms, 500);
    assert_eq!(metrics.end_reason, "user_disconnect");

    h.session.shutdown().await;
}

#[tokio::test]
async fn resampled_turn_plays_in_full() {
    let mut h = start(Behaviour::Accept, FakeDevices::with_speaker_rate(48_000));
    let remote = connect(&mut h).await;

    remote.send(InboundMessage::Audio(audio_chunk(0.25))).await;
    remote.send(InboundMessage::Audio(audio_chunk(0.25))).await;
    remote.send(InboundMessage::TurnComplete).await;
    remote
        .send(InboundMessage::OutputTranscription("Done.".to_string()))
        .await;
    assert_eq!(next_log(&mut h.logs).await.text, "Done.");

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;

    // Both chunks plus the resampler tail, without gaps or losses
    let metrics = h.session.last_metrics().expect("metrics recorded");
    assert!(metrics.chunks_played >= 2);
    assert!(
        (499..=500).contains(&metrics.audio_played_ms),
        "played {}ms",
        metrics.audio_played_ms
    );
    assert_eq!(metrics.decode_errors, 0);

    h.session.shutdown().await;
}

#[tokio::test]
async fn transcriptions_are_logged_in_order() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote
        .send(InboundMessage::InputTranscription("Who is this?".to_string()))
        .await;
    remote
        .send(InboundMessage::OutputTranscription("Hi, it's Alex".to_string()))
        .await;
    remote.send(InboundMessage::TurnComplete).await;
    remote
        .send(InboundMessage::OutputTranscription(" from OrbitAI.".to_string()))
        .await;

    let texts: Vec<(Role, String)> = vec![
        next_log(&mut h.logs).await,
        next_log(&mut h.logs).await,
        next_log(&mut h.logs).await,
    ]
    .into_iter()
    .map(|e| (e.role, e.text))
    .collect();

    assert_eq!(
        texts,
        vec![
            (Role::User, "Who is this?".to_string()),
            (Role::Model, "Hi, it's Alex".to_string()),
            (Role::Model, " from OrbitAI.".to_string()),
        ]
    );

    h.session.shutdown().await;
}

#[tokio::test]
async fn setup_carries_prompt_and_voice() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let _remote = connect(&mut h).await;

    let setups = h.transport.setups();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].system_prompt, "You are a reluctant prospect.");
    assert_eq!(setups[0].voice, Voice::Fenrir);
    assert!(setups[0].audio_output_requested);
    assert!(setups[0].input_transcription_requested);
    assert!(setups[0].output_transcription_requested);

    h.session.shutdown().await;
}

#[tokio::test]
async fn disconnect_releases_everything_once() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;
    assert_eq!(h.devices.opened(), 2);

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;

    let disconnected = next_log(&mut h.logs).await;
    assert_eq!(disconnected.text, "Disconnected");
    assert_eq!(h.devices.released(), 2);
    assert!(remote.shutdown.is_cancelled());
    assert_eq!(h.session.telemetry(), TelemetrySignal::default());

    // Repeated disconnects are no-ops
    h.session.disconnect().unwrap();
    h.session.disconnect().unwrap();
    h.session.shutdown().await;

    assert!(h.logs.recv().await.is_none());
    assert_eq!(h.devices.released(), 2);
}

#[tokio::test]
async fn disconnect_while_connecting_releases_devices() {
    let mut h = start(Behaviour::Hang, FakeDevices::new());

    h.session.connect(config()).unwrap();
    wait_for(&mut h.status, SessionStatus::Connecting).await;
    let devices = h.devices.clone();
    eventually(|| devices.opened() == 2).await;

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;
    assert_eq!(next_log(&mut h.logs).await.text, "Disconnected");

    eventually(|| devices.released() == 2).await;
    assert!(h.session.last_metrics().is_none());

    h.session.shutdown().await;
}

#[tokio::test]
async fn speech_while_connecting_leaves_signals_neutral() {
    let mut h = start(Behaviour::Hang, FakeDevices::new());

    h.session.connect(config()).unwrap();
    wait_for(&mut h.status, SessionStatus::Connecting).await;
    let devices = h.devices.clone();
    eventually(|| devices.opened() == 2).await;

    // Loud input while the transport is still being opened
    for _ in 0..8 {
        devices.speak(vec![0.5; 160]).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!h.session.telemetry().is_user_speaking);

    for _ in 0..8 {
        devices.speak(vec![0.5; 160]).await;
    }
    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;
    eventually(|| devices.released() == 2).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.session.telemetry(), TelemetrySignal::default());

    h.session.shutdown().await;
}

#[tokio::test]
async fn microphone_denied_ends_in_error() {
    let mut h = start(Behaviour::Accept, FakeDevices::denying_microphone());

    h.session.connect(config()).unwrap();
    wait_for(&mut h.status, SessionStatus::Error).await;

    let failure = next_log(&mut h.logs).await;
    assert_eq!(failure.role, Role::System);
    assert!(failure
        .text
        .starts_with("Failed to connect to audio devices"));

    // The speaker opened first and must be closed again
    assert_eq!(h.devices.opened(), 1);
    assert_eq!(h.devices.released(), 1);
    assert!(h.transport.setups().is_empty());

    h.session.shutdown().await;
}

#[tokio::test]
async fn refused_transport_ends_in_error() {
    let mut h = start(Behaviour::Refuse, FakeDevices::new());

    h.session.connect(config()).unwrap();
    wait_for(&mut h.status, SessionStatus::Error).await;

    let failure = next_log(&mut h.logs).await;
    assert_eq!(
        failure.text,
        "Error: Session setup rejected: API key not valid"
    );
    assert_eq!(h.devices.opened(), 2);
    assert_eq!(h.devices.released(), 2);

    // Exactly one log entry for the failure
    h.session.shutdown().await;
    assert!(h.logs.recv().await.is_none());
}

#[tokio::test]
async fn remote_close_disconnects() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote.inbound.send(InboundEvent::Closed).await.unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;

    assert_eq!(next_log(&mut h.logs).await.text, "Connection closed");
    assert_eq!(h.devices.released(), 2);
    assert_eq!(
        h.session.last_metrics().map(|m| m.end_reason),
        Some("remote_closed".to_string())
    );

    h.session.shutdown().await;
}

#[tokio::test]
async fn transport_error_then_reconnect() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote
        .inbound
        .send(InboundEvent::Error("socket reset".to_string()))
        .await
        .unwrap();
    wait_for(&mut h.status, SessionStatus::Error).await;

    assert_eq!(next_log(&mut h.logs).await.text, "Error: socket reset");
    assert_eq!(h.devices.released(), 2);

    // A fresh session can start from ERROR
    let _remote = connect(&mut h).await;
    assert_eq!(h.devices.opened(), 4);

    h.session.shutdown().await;
    assert_eq!(h.devices.released(), 4);
}

#[tokio::test]
async fn malformed_audio_keeps_session_connected() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote
        .send(InboundMessage::Audio(AudioChunk {
            data: "!!not base64!!".to_string(),
            mime_type: "audio/pcm;rate=24000".to_string(),
        }))
        .await;
    remote
        .send(InboundMessage::Audio(AudioChunk {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=24000".to_string(),
        }))
        .await;
    remote
        .send(InboundMessage::InputTranscription("Still there?".to_string()))
        .await;

    // Decode failures never reach the transcript
    let next = next_log(&mut h.logs).await;
    assert_eq!(next.text, "Still there?");
    assert_eq!(h.session.status(), SessionStatus::Connected);

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;
    assert_eq!(h.session.last_metrics().unwrap().decode_errors, 2);

    h.session.shutdown().await;
}

#[tokio::test]
async fn microphone_frames_reach_transport() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let mut remote = connect(&mut h).await;

    h.devices.speak(vec![0.5; 320]).await;

    for _ in 0..2 {
        let frame = timeout(WAIT, remote.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound closed");
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        // 160 samples of PCM16, base64 encoded
        assert_eq!(frame.data.len(), 428);
    }
    assert!(h.session.telemetry().is_user_speaking);

    h.devices.speak(vec![0.001; 160]).await;
    timeout(WAIT, remote.outbound.recv()).await.unwrap().unwrap();
    assert!(!h.session.telemetry().is_user_speaking);

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;
    assert_eq!(h.session.last_metrics().unwrap().frames_sent, 3);

    h.session.shutdown().await;
}

#[tokio::test]
async fn model_audio_drives_telemetry() {
    let mut h = start(Behaviour::Accept, FakeDevices::new());
    let remote = connect(&mut h).await;

    remote.send(InboundMessage::Audio(audio_chunk(0.2))).await;
    remote
        .send(InboundMessage::OutputTranscription("Listen.".to_string()))
        .await;
    next_log(&mut h.logs).await;

    // Play the scheduled audio through the sink
    let mixer = h.devices.mixer();
    let mut out = vec![0.0; 2048];
    mixer.render(&mut out, 1);

    let session = &h.session;
    eventually(|| session.telemetry().is_model_speaking).await;
    assert!(session.telemetry().volume > 0);

    h.session.disconnect().unwrap();
    wait_for(&mut h.status, SessionStatus::Disconnected).await;
    let signal = h.session.telemetry();
    assert!(!signal.is_model_speaking);
    assert_eq!(signal.volume, 0);

    h.session.shutdown().await;
}
