//! # Voice Session Client - Entry Point
//!
//! Terminal client for a real-time voice assistant server. Streams the
//! microphone to the server and plays the agent's voice back.
//!
//! ## Startup:
//! 1. `.env` and tracing
//! 2. Configuration (`config.toml` + `APP_*` environment variables + an
//!    optional JSON override as the first argument)
//! 3. Optional session settings file, sent as the first frame
//! 4. Start the session and run it until the server closes or Ctrl+C
//!
//! ## Modules:
//! - **audio**: capture, playback, PCM codec, resampling
//! - **protocol**: wire messages, transcript, connection state machine
//! - **websocket**: socket task behind the protocol's `Transport` seam
//! - **session**: the orchestrator that wires everything together
//! - **state**: shared context store and metrics
//! - **config** / **error**: configuration and the crate error type

mod audio;
mod config;
mod error;
mod protocol;
mod session;
mod state;
mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use config::AppConfig;
use protocol::session::SessionConfig;
use protocol::transcript::Sender;
use session::VoiceSession;
use state::ClientState;
use tracing::{error, info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let mut config = AppConfig::load()?;
    config.validate()?;

    // Optional JSON override, e.g. `'{"server": {"port": 9000}}'`
    if let Some(overrides) = std::env::args().nth(1) {
        config.update_from_json(&overrides)?;
        info!("Applied command line configuration overrides");
    }

    info!("Starting voice-session-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Server: {}:{}{} (secure: {})",
        config.server.host, config.server.port, config.server.path, config.server.secure
    );

    let settings = config.load_session_settings()?;
    if settings.is_none() {
        info!("No session settings file configured, connecting without settings");
    }
    let session_config = SessionConfig {
        settings,
        api_key_configured: config.session.api_key_configured,
    };

    let state = ClientState::new();
    let mut session = VoiceSession::new(config, session_config, state.clone());

    setup_signal_handlers();

    if let Err(e) = session.start().await {
        error!(error = %e, kind = e.kind(), transport = e.terminates_session(), "Failed to start voice session");
        print_log(&session);
        return Err(e.into());
    }

    spawn_level_meter(&session);
    session.run(wait_for_shutdown()).await?;

    print_log(&session);
    let notes = session.protocol().transcript().notes();
    if !notes.is_empty() {
        println!("\n{}", notes);
    }

    let metrics = state.get_metrics_snapshot();
    info!(
        frames_sent = metrics.frames_sent,
        bytes_sent = metrics.bytes_sent,
        audio_bytes_dropped = metrics.audio_bytes_dropped,
        frames_received = metrics.frames_received,
        decode_errors = metrics.decode_errors,
        context_keys = state.get_context().len(),
        uptime_seconds = state.get_uptime_seconds(),
        finished = session.protocol().is_finished(),
        "Voice session finished"
    );
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate only.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                if tokio::signal::ctrl_c().await.is_ok() {
                    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

/// Trace the microphone level while the session runs.
fn spawn_level_meter(session: &VoiceSession) {
    let mut spectrum = session.spectrum();
    tokio::spawn(async move {
        while spectrum.changed().await.is_ok() {
            let frame = spectrum.borrow_and_update().clone();
            trace!(rms = frame.rms, peak_bin = ?frame.peak_bin(), "Input level");
        }
    });
}

fn print_log(session: &VoiceSession) {
    for entry in session.protocol().log() {
        let sender = match entry.sender {
            Sender::System => "system",
            Sender::Agent => "agent",
            Sender::User => "user",
        };
        println!("[{}] {}", sender, entry.text);
    }
}
