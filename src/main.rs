use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_chat_bridge::{
    AudioSink, BridgeConfig, EventIngress, JsonLinesSource, SessionManager, TurnProcessor,
    WebSocketConnector,
};

/// WaaV Chat Bridge - answers live-room chat through a conversational back-end
#[derive(Parser, Debug)]
#[command(name = "waav-chat-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Character the back-end should play (overrides configuration)
    #[arg(long = "role", value_name = "NAME")]
    role: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Needed before any wss:// connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let mut config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        BridgeConfig::from_file(&config_path)?
    } else {
        BridgeConfig::from_env()?
    };
    if let Some(role) = cli.role {
        config = config.with_role(role)?;
    }

    let session_url = config.session_url()?;
    info!(url = %session_url, "Starting chat bridge");

    let audio = if config.audio_enabled {
        AudioSink::open_default(config.pcm_format())
    } else {
        info!("Audio playback disabled by configuration");
        AudioSink::disabled()
    };
    audio.start();

    let connector = Arc::new(WebSocketConnector::new(session_url));
    let mut session = SessionManager::new(connector, audio.clone(), config.session_config());
    if let Err(e) = session.connect().await {
        audio.stop().await;
        anyhow::bail!("Unable to reach the back-end: {e}");
    }

    let (ingress, queue) = EventIngress::new(config.song_keywords.clone());
    let processor = TurnProcessor::new(session, audio, queue, config.turn_config());

    let shutdown = CancellationToken::new();
    let mut processor_task = tokio::spawn(processor.run(shutdown.clone()));

    info!("Listening for chat events on stdin");
    let mut source = JsonLinesSource::stdin();
    let interrupted = tokio::select! {
        result = ingress.forward(&mut source) => {
            match result {
                Ok(count) => info!(count, "Event source ended"),
                Err(e) => tracing::error!(error = %e, "Event source failed"),
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    // Closing the queue lets the processor finish what is already queued
    drop(ingress);
    let finished = if interrupted {
        None
    } else {
        tokio::select! {
            result = &mut processor_task => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        }
    };

    shutdown.cancel();
    match finished {
        Some(result) => result?,
        None => {
            info!("Interrupted, shutting down");
            processor_task.await?
        }
    }

    info!("Chat bridge stopped");
    Ok(())
}
