//! MediaRise Robot Client
//!
//! Тестовый клиент для MediaRise Robot Console: голосовая сессия через
//! WebSocket и расчет HMAC для активации устройства.

mod config;
mod devices;
mod error;
mod utils;
mod websocket;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::AudioFormat;
use crate::error::ClientError;
use crate::utils::crypto;
use crate::websocket::session::StopFlag;

/// Test client for the MediaRise Robot Console
#[derive(Parser)]
#[command(name = "robot-client", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record from the microphone, send it to the console and play the answer
    Session {
        /// WebSocket endpoint, e.g. ws://localhost:8080/ws
        #[arg(long)]
        url: Option<String>,
        /// Audio format requested for responses (opus or mp3)
        #[arg(long)]
        audio_format: Option<AudioFormat>,
        /// Recording duration in seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// How long to wait for the answer after sending audio, in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Directory for saved MP3 answers and undecodable chunks
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Compute the HMAC-SHA256 activation response for a challenge
    Hmac {
        challenge: String,
        /// HMAC key; defaults to HMAC_KEY
        key: Option<String>,
        /// Serial number for the activation request body
        #[arg(long, default_value = "SN123456789")]
        serial: String,
        /// Sign "<algorithm><serial><challenge>" the way /ota/activate verifies it
        #[arg(long)]
        full: bool,
        /// Check a response received from a device instead of only printing ours
        #[arg(long)]
        verify: Option<String>,
    },
    /// Generate a random activation challenge
    Challenge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediarise_robot_client=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = config::Config::load()?;

    match cli.command {
        Command::Session {
            url,
            audio_format,
            seconds,
            timeout,
            output_dir,
        } => {
            if let Some(url) = url {
                config.server.url = url;
            }
            if let Some(format) = audio_format {
                config.session.audio_format = format;
            }
            if let Some(seconds) = seconds {
                config.session.record_seconds = seconds;
            }
            if let Some(timeout) = timeout {
                config.session.response_timeout_secs = timeout;
            }
            if let Some(dir) = output_dir {
                config.session.output_dir = dir;
            }
            run_session(config).await
        }
        Command::Hmac {
            challenge,
            key,
            serial,
            full,
            verify,
        } => {
            let key = key.unwrap_or(config.security.hmac_key);
            let message = if full {
                crypto::activation_message(crypto::ACTIVATION_ALGORITHM, &serial, &challenge)
            } else {
                challenge.clone()
            };
            let response = crypto::compute_hmac(key.as_bytes(), message.as_bytes());

            if let Some(signature) = verify {
                let valid = crypto::verify_hmac(key.as_bytes(), message.as_bytes(), &signature);
                println!("Signature valid: {}", valid);
                return Ok(());
            }

            println!("Challenge: {}", challenge);
            println!("HMAC Key: {}", key);
            println!("Response: {}", response);
            println!();
            println!("Activation request body:");
            println!(
                "{}",
                serde_json::to_string_pretty(&crypto::activation_request(&serial, &challenge, &response))?
            );
            Ok(())
        }
        Command::Challenge => {
            println!("{}", crypto::generate_challenge());
            Ok(())
        }
    }
}

async fn run_session(config: config::Config) -> Result<()> {
    info!("Starting MediaRise Robot Console WebSocket Client...");
    info!(
        "Will record {} seconds of audio from microphone",
        config.session.record_seconds
    );

    // Ctrl-C не обрывает сессию, а запускает обычное завершение
    let stop = StopFlag::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted by user, closing session");
            interrupt.set();
        }
    });

    let report = match websocket::run_session(&config.server.url, config.session.clone(), stop).await {
        Ok(report) => report,
        Err(ClientError::Interrupted) => {
            warn!("Session interrupted before it started");
            return Ok(());
        }
        Err(e) => {
            error!("Session failed: {}", e);
            if let Some(hint) = e.remediation() {
                error!("{}", hint);
            }
            return Err(e.into());
        }
    };

    if report.timed_out {
        warn!("Server did not finish answering in time");
    }
    info!(
        "Session {} finished: {} frames sent, {} events, {} audio chunks",
        report.session_id.as_deref().unwrap_or("<none>"),
        report.frames_sent,
        report.events.len(),
        report.chunks.len()
    );
    Ok(())
}
