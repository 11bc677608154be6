//! Listener side: one task per accepted connection.
//!
//! ```text
//! AwaitHeader ─┬─ SendString ──────────────────▶ AwaitBody ─▶ Closed
//!              └─ SendFile ─▶ AwaitMetadata ───▶ AwaitBody ─▶ Closed
//! ```
//!
//! A failing connection is logged and dropped; it never stops the accept
//! loop or touches other parts of the same transfer.

use super::finalize::{remove_part, Finalizer};
use super::reconcile::{reserve_dir, reserve_file};
use super::throughput::ThroughputMeter;
use super::tracker::DownloadTracker;
use crate::config::Settings;
use crate::network::codec::read_raw;
use crate::network::{Connection, PartMetadata, PeerConnection, RequestHeader, RequestType};
use crate::utils::{format_file_size, sanitize_filename};
use crate::{FileshareError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    MessageReceived {
        transfer_id: Uuid,
        text: String,
    },
    PartReceived {
        transfer_id: Uuid,
        part_index: u32,
        bytes: u64,
    },
    TransferFinalized {
        transfer_id: Uuid,
        path: PathBuf,
    },
    /// The part files are left on disk for recovery.
    FinalizationFailed {
        transfer_id: Uuid,
        error: String,
        part_files: Vec<PathBuf>,
    },
    ConnectionFailed {
        peer: String,
        error: String,
    },
}

pub struct TransferReceiver {
    handler: ConnectionHandler,
    completed_rx: mpsc::UnboundedReceiver<Uuid>,
}

impl TransferReceiver {
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        settings.validate()?;
        let (tracker, completed_rx) = DownloadTracker::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            handler: ConnectionHandler {
                settings,
                tracker,
                events,
            },
            completed_rx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReceiverEvent> {
        self.handler.events.subscribe()
    }

    pub fn tracker(&self) -> Arc<DownloadTracker> {
        self.handler.tracker.clone()
    }

    /// Per-connection entry point, usable without a listener.
    pub fn handler(&self) -> ConnectionHandler {
        self.handler.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.handler.settings.bind_address();
        TcpListener::bind(address)
            .await
            .map_err(|e| FileshareError::Config(format!("Failed to listen on {}: {}", address, e)))
    }

    /// Binds the configured port and serves forever.
    pub async fn listen(self) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Serves `listener` forever. Accept failures are logged and retried.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let Self {
            handler,
            completed_rx,
        } = self;

        info!("Listening on `{}`", listener.local_addr()?);
        info!(
            "Downloads go to {:?}",
            handler.settings.receiver.download_dir
        );

        let finalizer = Finalizer::new(
            handler.settings.clone(),
            handler.tracker.clone(),
            completed_rx,
            handler.events.clone(),
        );
        tokio::spawn(finalizer.run());

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to disable Nagle for {}: {}", addr, e);
                    }
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, addr.to_string()).await;
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ConnectionHandler {
    settings: Arc<Settings>,
    tracker: Arc<DownloadTracker>,
    events: broadcast::Sender<ReceiverEvent>,
}

impl ConnectionHandler {
    pub async fn handle<C: Connection>(&self, stream: C, peer: String) {
        let started = Instant::now();

        if let Err(e) = self.process(stream).await {
            error!("Connection from {} failed: {}", peer, e);
            let _ = self.events.send(ReceiverEvent::ConnectionFailed {
                peer: peer.clone(),
                error: e.to_string(),
            });
        }

        info!("Connection from {} took {:?}", peer, started.elapsed());
    }

    async fn process<C: Connection>(&self, stream: C) -> Result<()> {
        let mut conn = PeerConnection::new(
            stream,
            self.settings.transfer.max_frame_size,
            self.settings.io_timeout(),
        );

        let header: RequestHeader = conn.read_json().await?;
        debug!(
            "request_header: {} {}",
            header.request_type, header.transfer_id
        );

        match header.request_type {
            RequestType::SendString => {
                let mut body = conn.into_body();
                self.receive_string(header.transfer_id, &mut body).await
            }
            RequestType::SendFile => {
                let metadata: PartMetadata = conn.read_json().await?;
                debug!("part metadata: {:?}", metadata);
                let mut body = conn.into_body();
                self.receive_part(header.transfer_id, metadata, &mut body)
                    .await
            }
        }
    }

    async fn receive_string<R>(&self, transfer_id: Uuid, body: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let io_timeout = self.settings.io_timeout();
        let mut buf = vec![0u8; self.settings.transfer.read_buffer_size];
        let mut data = Vec::new();

        loop {
            let n = read_raw(body, &mut buf, io_timeout).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        if data.is_empty() {
            warn!("Read 0 bytes for message {}", transfer_id);
        }

        let text = String::from_utf8_lossy(&data).into_owned();
        info!("Message: `{}`", text);
        let _ = self
            .events
            .send(ReceiverEvent::MessageReceived { transfer_id, text });
        Ok(())
    }

    async fn receive_part<R>(
        &self,
        transfer_id: Uuid,
        metadata: PartMetadata,
        body: &mut R,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        if metadata.is_dir {
            return Err(FileshareError::FileOperation(format!(
                "{:?} is a directory; directory transfers are not supported",
                metadata.name
            )));
        }

        let part_index = metadata.resolve_part_index()?;
        let total_parts = metadata.resolve_part_count(self.settings.transfer.part_count);
        if part_index >= total_parts {
            return Err(FileshareError::Protocol(format!(
                "part index {} out of range for {} parts",
                part_index, total_parts
            )));
        }

        let file_name = sanitize_filename(&metadata.name);
        let download_dir = &self.settings.receiver.download_dir;
        let (handle, created) = self
            .tracker
            .get_or_create(transfer_id, &file_name, total_parts, || {
                reserve_dir(download_dir)
            })
            .await?;
        if created {
            info!(
                "Receiving {:?} ({} parts) as transfer {}",
                file_name, total_parts, transfer_id
            );
        }

        let part_name = sanitize_filename(&metadata.part_name);
        self.tracker.part_started(transfer_id, part_index)?;
        let (part_path, file) = match reserve_file(&handle.destination_dir.join(&part_name)).await
        {
            Ok(reserved) => reserved,
            Err(e) => {
                self.tracker.record_part_failed(transfer_id, part_index);
                return Err(FileshareError::FileOperation(format!(
                    "transfer {} part {:?}: {}",
                    transfer_id, part_name, e
                )));
            }
        };

        let received = match self.write_part(body, file, &metadata).await {
            Ok(received) => received,
            Err(e) => {
                remove_part(&part_path).await;
                self.tracker.record_part_failed(transfer_id, part_index);
                return Err(FileshareError::Transfer(format!(
                    "transfer {} part {} ({:?}): {}",
                    transfer_id, part_index, part_name, e
                )));
            }
        };

        let complete = match self
            .tracker
            .record_part_complete(transfer_id, part_index, part_path.clone())
        {
            Ok(complete) => complete,
            Err(e) => {
                remove_part(&part_path).await;
                return Err(e);
            }
        };

        info!(
            "Received part {} of transfer {} ({})",
            part_index,
            transfer_id,
            format_file_size(received)
        );
        let _ = self.events.send(ReceiverEvent::PartReceived {
            transfer_id,
            part_index,
            bytes: received,
        });

        if complete {
            info!(
                "All {} parts of transfer {} received, queued for finalization",
                total_parts, transfer_id
            );
        }
        Ok(())
    }

    /// Streams the body into `file` through a bounded buffer, flushing when
    /// the buffer passes the threshold or the flush interval elapses.
    async fn write_part<R>(&self, body: &mut R, file: File, metadata: &PartMetadata) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let transfer = &self.settings.transfer;
        let io_timeout = self.settings.io_timeout();
        let flush_interval = self.settings.flush_interval();

        let mut writer = BufWriter::with_capacity(transfer.file_buffer_size, file);
        let mut buf = vec![0u8; transfer.read_buffer_size];
        let mut meter = ThroughputMeter::new(
            format!("Download speed [{}]", metadata.part_name),
            self.settings.throughput_interval(),
        );
        let mut last_flush = Instant::now();
        let mut received = 0u64;

        loop {
            let n = read_raw(body, &mut buf, io_timeout).await?;
            if n == 0 {
                break;
            }

            received += n as u64;
            if received > metadata.size {
                return Err(FileshareError::Transfer(format!(
                    "received more than the declared {} bytes",
                    metadata.size
                )));
            }

            writer.write_all(&buf[..n]).await?;
            meter.record(n);

            if writer.buffer().len() > transfer.flush_threshold
                || last_flush.elapsed() >= flush_interval
            {
                writer.flush().await?;
                last_flush = Instant::now();
            }
        }

        writer.flush().await?;

        if received == 0 {
            warn!("Read 0 bytes for part {:?}", metadata.part_name);
        }
        if received != metadata.size {
            return Err(FileshareError::Transfer(format!(
                "stream ended after {} of {} bytes",
                received, metadata.size
            )));
        }

        Ok(received)
    }
}
