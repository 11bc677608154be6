use anyhow::Context;
use clap::{Parser, Subcommand};
use fileshare_parts::config::Settings;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fileshare-parts")]
#[command(about = "Parallel multi-part file transfer over TCP")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept transfers until interrupted
    Receive {
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory downloads are written into
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Send one or more files to a peer
    Send {
        #[arg(short, long)]
        address: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Number of parts each file is split into
        #[arg(long)]
        parts: Option<u32>,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Send a text message to a peer
    Message {
        #[arg(short, long)]
        address: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fileshare_parts={}", log_level).into()),
        )
        .init();

    info!("Starting fileshare-parts v{}", env!("CARGO_PKG_VERSION"));

    let mut settings =
        Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    let work = async move {
        match cli.command {
            Command::Receive { port, output } => {
                if let Some(port) = port {
                    settings.network.port = port;
                }
                if let Some(output) = output {
                    settings.receiver.download_dir = output;
                }
                fileshare_parts::start_listener_with(settings).await?;
            }
            Command::Send {
                address,
                port,
                parts,
                files,
            } => {
                apply_peer(&mut settings, address, port);
                if let Some(parts) = parts {
                    settings.transfer.part_count = parts;
                }
                fileshare_parts::send_files_with(settings, &files).await?;
            }
            Command::Message {
                address,
                port,
                text,
            } => {
                apply_peer(&mut settings, address, port);
                fileshare_parts::send_string_with(settings, &text).await?;
            }
        }
        Ok::<_, fileshare_parts::FileshareError>(())
    };

    tokio::select! {
        result = work => {
            if let Err(e) = result {
                error!("{}", e);
                return Err(e.into());
            }
        }
        result = shutdown_signal() => {
            result.context("failed to install signal handlers")?;
            info!("Shutdown signal received, stopping...");
        }
    }

    Ok(())
}

fn apply_peer(settings: &mut Settings, address: Option<String>, port: Option<u16>) {
    if let Some(address) = address {
        settings.network.address = address;
    }
    if let Some(port) = port {
        settings.network.port = port;
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
