//! Live voice session
//!
//! One session at a time: microphone frames go up to the live service, its
//! audio comes back down into gapless playback, and an interruption from the
//! service flushes whatever is still queued.
//!
//! Control calls on [`LiveSession`] only enqueue events. A single loop task
//! owns the state machine and every session resource, so inbound messages,
//! playback scheduling and teardown are processed strictly one at a time.

pub mod metrics;
mod runtime;
pub mod state_machine;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::audio::{AudioDevices, AudioError, CAPTURE_FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::live::{LiveTransport, TransportError, Voice};
use crate::settings::AppSettings;
use crate::telemetry::{SessionSignals, TelemetrySignal, DEFAULT_SAMPLE_INTERVAL};
use crate::transcript::{create_log_channel, LogReceiver};

pub use metrics::SessionMetrics;
pub use state_machine::{reduce, Effect, EndReason, Event, State};

use runtime::{LoopInput, SessionRuntime};

/// What a collaborator supplies per session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub system_prompt: String,
    pub voice: Voice,
}

impl SessionConfig {
    pub fn new(system_prompt: impl Into<String>, voice: Voice) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            voice,
        }
    }
}

/// Lifecycle status exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&State> for SessionStatus {
    fn from(state: &State) -> Self {
        match state {
            State::Disconnected => SessionStatus::Disconnected,
            State::Connecting { .. } => SessionStatus::Connecting,
            State::Connected { .. } => SessionStatus::Connected,
            State::Error { .. } => SessionStatus::Error,
        }
    }
}

/// Failure while bringing a session up.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Microphone could not be opened (including permission denied)
    Microphone(AudioError),
    /// Output device could not be opened
    Speaker(AudioError),
    Transport(TransportError),
    /// A setup task died unexpectedly
    Internal(String),
}

impl SessionError {
    /// Text appended to the transcript when the connect attempt fails.
    pub fn transcript_text(&self) -> String {
        match self {
            SessionError::Microphone(e) | SessionError::Speaker(e) => {
                format!("Failed to connect to audio devices: {}", e)
            }
            SessionError::Transport(e) => format!("Error: {}", e),
            SessionError::Internal(e) => format!("Error: {}", e),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Microphone(e) => write!(f, "Microphone unavailable: {}", e),
            SessionError::Speaker(e) => write!(f, "Speaker unavailable: {}", e),
            SessionError::Transport(e) => write!(f, "{}", e),
            SessionError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Microphone(e) | SessionError::Speaker(e) => Some(e),
            SessionError::Transport(e) => Some(e),
            SessionError::Internal(_) => None,
        }
    }
}

/// A control call could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// The session loop has shut down
    Stopped,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Stopped => write!(f, "Session loop is not running"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Audio and timing parameters for every session started by one handle.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_frame_size: usize,
    pub telemetry_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_frame_size: CAPTURE_FRAME_SIZE,
            telemetry_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl From<&AppSettings> for SessionOptions {
    fn from(settings: &AppSettings) -> Self {
        Self {
            input_sample_rate: settings.input_sample_rate,
            output_sample_rate: settings.output_sample_rate,
            capture_frame_size: settings.capture_frame_size,
            telemetry_interval: Duration::from_millis(settings.telemetry_interval_ms),
        }
    }
}

/// Handle to the session loop.
///
/// Dropping the handle asks the loop to exit, which releases any open
/// devices and connection. Use [`LiveSession::shutdown`] to wait for that.
pub struct LiveSession {
    tx: mpsc::UnboundedSender<LoopInput>,
    status: watch::Receiver<SessionStatus>,
    signals: Arc<SessionSignals>,
    metrics: Arc<Mutex<Option<SessionMetrics>>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl LiveSession {
    /// Spawn the session loop. Must be called inside a tokio runtime.
    ///
    /// Returns the handle and the receiving end of the conversation log.
    pub fn start(
        transport: Arc<dyn LiveTransport>,
        devices: Arc<dyn AudioDevices>,
        options: SessionOptions,
    ) -> (Self, LogReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = create_log_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);
        let signals = Arc::new(SessionSignals::default());
        let metrics = Arc::new(Mutex::new(None));

        let runtime = SessionRuntime::new(
            transport,
            devices,
            options,
            signals.clone(),
            log_tx,
            status_tx,
            metrics.clone(),
            tx.clone(),
        );
        let task = tokio::spawn(runtime.run(rx));

        (
            Self {
                tx,
                status: status_rx,
                signals,
                metrics,
                task: Some(task),
            },
            log_rx,
        )
    }

    /// Request a new session. Returns immediately; progress is reported
    /// through the status channel and the log.
    pub fn connect(&self, config: SessionConfig) -> Result<(), ControlError> {
        log::info!("Session: connect requested (voice {})", config.voice);
        self.send(Event::Connect { config })
    }

    /// End the current session, or cancel one that is still connecting.
    /// A no-op when already disconnected.
    pub fn disconnect(&self) -> Result<(), ControlError> {
        log::info!("Session: disconnect requested");
        self.send(Event::Disconnect)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest speaking/volume signals.
    pub fn telemetry(&self) -> TelemetrySignal {
        self.signals.snapshot()
    }

    /// Metrics of the most recent session that reached CONNECTED.
    pub fn last_metrics(&self) -> Option<SessionMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear everything down and wait for the loop to finish.
    pub async fn shutdown(mut self) {
        let _ = self.send(Event::Exit);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Session loop task failed: {}", e);
            }
        }
    }

    fn send(&self, event: Event) -> Result<(), ControlError> {
        self.tx
            .send(LoopInput::Event(event))
            .map_err(|_| ControlError::Stopped)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.tx.send(LoopInput::Event(Event::Exit));
        }
    }
}
