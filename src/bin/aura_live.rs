//! CLI binary for Aura live voice sessions.

use anyhow::Context;
use aura::audio::capture::CpalMicrophone;
use aura::audio::playback::CpalSpeaker;
use aura::live::GeminiLiveEndpoint;
use aura::{Credential, LiveConfig, SessionConfig, SessionController, SessionStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Aura: real-time voice conversation with a native-audio model.
#[derive(Parser)]
#[command(name = "aura-live", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Start a live voice session.
    Live,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the status line.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aura=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => LiveConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let path = LiveConfig::default_config_path();
            if path.exists() {
                LiveConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?
            } else {
                LiveConfig::default()
            }
        }
    };

    match cli.command.unwrap_or(Command::Live) {
        Command::Live => run_live(config).await,
        Command::Devices => list_devices(),
    }
}

async fn run_live(config: LiveConfig) -> anyhow::Result<()> {
    println!("Aura v{}", env!("CARGO_PKG_VERSION"));

    let credential = Credential::from_env(&config.endpoint.api_key_env);
    let session = SessionConfig::new(&config, credential);

    let controller = SessionController::spawn(
        Arc::new(GeminiLiveEndpoint),
        Arc::new(CpalMicrophone::new(config.audio.input_device.clone())),
        Arc::new(CpalSpeaker::new(config.audio.output_device.clone())),
    );
    let mut status = controller.status();

    controller.start(session).await?;
    println!("\nPress Ctrl+C to end the conversation.\n");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = status.borrow_and_update().clone();
                println!("{current}");
                match current {
                    SessionStatus::Error(msg) => break Err(anyhow::anyhow!(msg)),
                    SessionStatus::Idle => break Ok(()),
                    _ => {}
                }
            }
        }
    };

    controller.stop().await?;
    controller.shutdown().await;
    outcome
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalSpeaker::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
