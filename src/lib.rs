pub mod config;
pub mod error;
pub mod network;
pub mod transfer;
pub mod utils;

pub use error::{FileshareError, Result};

use config::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use transfer::{TransferReceiver, TransferSender};

/// Serves incoming transfers on `port`, writing into `output_dir`. Runs
/// until the listener fails to bind or the task is dropped.
pub async fn start_listener(port: u16, output_dir: impl Into<PathBuf>) -> Result<()> {
    let mut settings = Settings::default();
    settings.network.port = port;
    settings.receiver.download_dir = output_dir.into();
    start_listener_with(settings).await
}

pub async fn start_listener_with(settings: Settings) -> Result<()> {
    TransferReceiver::new(Arc::new(settings))?.listen().await
}

/// Sends each file in `paths` to `peer_address:port`, one after another.
pub async fn send_files(peer_address: &str, port: u16, paths: &[PathBuf]) -> Result<()> {
    let mut settings = Settings::default();
    settings.network.address = peer_address.to_string();
    settings.network.port = port;
    send_files_with(settings, paths).await
}

pub async fn send_files_with(settings: Settings, paths: &[PathBuf]) -> Result<()> {
    sender_for(settings)?.send_files(paths).await
}

pub async fn send_string(peer_address: &str, port: u16, text: &str) -> Result<()> {
    let mut settings = Settings::default();
    settings.network.address = peer_address.to_string();
    settings.network.port = port;
    send_string_with(settings, text).await
}

pub async fn send_string_with(settings: Settings, text: &str) -> Result<()> {
    sender_for(settings)?.send_string(text).await
}

fn sender_for(settings: Settings) -> Result<TransferSender> {
    settings.validate()?;
    let peer = settings.peer_address();
    Ok(TransferSender::new(Arc::new(settings), peer))
}
