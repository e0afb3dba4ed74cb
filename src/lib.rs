//! Live, interruptible voice sessions against a streaming speech model.
//!
//! [`session::LiveSession`] is the entry point: it captures the microphone,
//! streams frames to the service through a [`live::LiveTransport`], plays the
//! replies back gaplessly and flushes playback when the service reports an
//! interruption. Collaborators supply a prompt and voice, read status and
//! telemetry, and consume the conversation log.

pub mod audio;
pub mod live;
pub mod playback;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod transcript;

pub use live::{GeminiLiveClient, LiveTransport, Voice};
pub use session::{
    ControlError, LiveSession, SessionConfig, SessionError, SessionMetrics, SessionOptions,
    SessionStatus,
};
pub use settings::AppSettings;
pub use telemetry::TelemetrySignal;
pub use transcript::{LogEvent, LogReceiver, Role};
