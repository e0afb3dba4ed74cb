use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use callsim::audio::CpalDevices;
use callsim::settings::{default_settings_path, load_settings, save_settings};
use callsim::{
    AppSettings, GeminiLiveClient, LiveSession, LogEvent, SessionConfig, SessionOptions,
    SessionStatus, Voice,
};

/// Hold a live voice conversation with a Gemini Live persona
#[derive(Parser)]
#[command(name = "callsim", version, about)]
struct Cli {
    /// System prompt for the model
    #[arg(short, long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the system prompt from a file
    #[arg(long, value_name = "PATH")]
    prompt_file: Option<PathBuf>,

    /// Prebuilt voice (Puck, Charon, Kore, Fenrir, Aoede, Leda, Orus, Zephyr)
    #[arg(long)]
    voice: Option<Voice>,

    /// Model override
    #[arg(long)]
    model: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_settings: bool,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("callsim: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns false if the session ended in an error.
async fn run(cli: Cli) -> Result<bool, String> {
    let settings_path = match cli.settings {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let mut settings = load_settings(&settings_path);
    if let Some(model) = cli.model {
        settings.model = model;
    }
    if let Some(voice) = cli.voice {
        settings.voice = voice;
    }
    if cli.save_settings {
        save_settings(&settings_path, &settings)?;
        log::info!("Settings saved to {:?}", settings_path);
    }

    let system_prompt = match (cli.prompt, cli.prompt_file) {
        (Some(prompt), _) => prompt,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read prompt file {:?}: {}", path, e))?,
        (None, None) => String::new(),
    };

    let transport = Arc::new(client_for(&settings, cli.api_key));
    let (session, mut log_rx) = LiveSession::start(
        transport,
        Arc::new(CpalDevices),
        SessionOptions::from(&settings),
    );
    let mut status_rx = session.subscribe_status();

    session
        .connect(SessionConfig::new(system_prompt, settings.voice))
        .map_err(|e| e.to_string())?;

    let mut started = false;
    let mut stopping = false;
    let mut ok = true;

    loop {
        tokio::select! {
            Some(event) = log_rx.recv() => print_event(&event),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                match status {
                    SessionStatus::Connecting | SessionStatus::Connected => started = true,
                    SessionStatus::Error => {
                        ok = false;
                        break;
                    }
                    SessionStatus::Disconnected if started || stopping => break,
                    SessionStatus::Disconnected => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                session.disconnect().map_err(|e| e.to_string())?;
            }
        }
    }

    while let Ok(event) = log_rx.try_recv() {
        print_event(&event);
    }

    if let Some(metrics) = session.last_metrics() {
        log::info!(
            "Session summary: {}",
            serde_json::to_string(&metrics).unwrap_or_default()
        );
    }
    session.shutdown().await;

    Ok(ok)
}

fn client_for(settings: &AppSettings, api_key: Option<String>) -> GeminiLiveClient {
    GeminiLiveClient::new(api_key)
        .with_model(settings.model.clone())
        .with_connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
        .with_outbound_queue(settings.outbound_queue_frames)
}

fn print_event(event: &LogEvent) {
    println!(
        "[{}] {}: {}",
        event.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
        event.role,
        event.text
    );
}
