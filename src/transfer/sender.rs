//! Sending side: one connection per part, at most `max_parallel_parts` in
//! flight.

use super::splitter::{open_part, split_ranges, ByteRange};
use super::throughput::ThroughputMeter;
use crate::config::Settings;
use crate::network::codec::{finish, write_raw};
use crate::network::{PartMetadata, PeerConnection, RequestHeader};
use crate::utils::format_file_size;
use crate::{FileshareError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct TransferSender {
    settings: Arc<Settings>,
    peer_addr: String,
}

impl TransferSender {
    pub fn new(settings: Arc<Settings>, peer_addr: impl Into<String>) -> Self {
        Self {
            settings,
            peer_addr: peer_addr.into(),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        info!("Dialing: {}", self.peer_addr);
        let stream = timeout(
            self.settings.connect_timeout(),
            TcpStream::connect(&self.peer_addr),
        )
        .await
        .map_err(|_| FileshareError::Timeout("connecting to peer"))??;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    pub async fn send_string(&self, text: &str) -> Result<()> {
        let io_timeout = self.settings.io_timeout();
        let mut conn = PeerConnection::new(
            self.connect().await?,
            self.settings.transfer.max_frame_size,
            io_timeout,
        );

        let header = RequestHeader::send_string();
        debug!("request_header: {:?}", header);
        conn.write_json(&header).await?;

        let mut stream = conn.into_inner();
        timeout(io_timeout, stream.write_all(text.as_bytes()))
            .await
            .map_err(|_| FileshareError::Timeout("writing message"))??;
        finish(&mut stream, io_timeout).await?;

        info!("Sent message of {} bytes", text.len());
        Ok(())
    }

    /// Sends every path in order. Stops at the first file that fails.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let started = Instant::now();
            let transfer_id = self.send_file(path).await?;
            info!(
                "Sent {:?} as transfer {} in {:?}",
                path,
                transfer_id,
                started.elapsed()
            );
        }
        Ok(())
    }

    pub async fn send_file(&self, path: &Path) -> Result<Uuid> {
        self.send_file_in_parts(path, self.settings.transfer.part_count)
            .await
    }

    /// Splits `path` into `part_count` parts and sends them in parallel under
    /// a fresh transfer id. Every part runs to completion even when a sibling
    /// fails; the error for the lowest failing part index is returned.
    pub async fn send_file_in_parts(&self, path: &Path, part_count: u32) -> Result<Uuid> {
        let metadata = PartMetadata::from_file(path)?;
        if metadata.is_dir {
            return Err(FileshareError::FileOperation(format!(
                "{:?} is a directory; directory transfers are not supported",
                path
            )));
        }

        let ranges = split_ranges(metadata.size, part_count)?;
        let transfer_id = Uuid::new_v4();
        info!(
            "Sending {:?} ({}) in {} parts as transfer {}",
            path,
            format_file_size(metadata.size),
            part_count,
            transfer_id
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.transfer.max_parallel_parts));
        let mut join_set = JoinSet::new();

        for (index, range) in (0u32..).zip(ranges) {
            let sender = self.clone();
            let semaphore = semaphore.clone();
            let path = path.to_path_buf();
            let part = metadata.for_part(index, part_count, range.length);

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => sender.send_part(transfer_id, &path, &part, range).await,
                    Err(_) => Err(FileshareError::Transfer(
                        "part scheduler closed".to_string(),
                    )),
                };
                (index, result.map_err(|e| FileshareError::part_failed(path, index, e)))
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(sent))) => {
                    debug!("Part {} done ({} bytes)", index, sent);
                }
                Ok((index, Err(e))) => {
                    error!("{}", e);
                    failures.push((index, e));
                }
                Err(e) => {
                    error!("Part task panicked: {:?}", e);
                    failures.push((
                        u32::MAX,
                        FileshareError::Transfer(format!("part task panicked: {}", e)),
                    ));
                }
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(transfer_id),
        }
    }

    /// Sends one part on its own connection. Exposed so a caller can retry a
    /// single failed part under the same transfer id.
    pub async fn send_part(
        &self,
        transfer_id: Uuid,
        path: &Path,
        metadata: &PartMetadata,
        range: ByteRange,
    ) -> Result<u64> {
        let transfer = &self.settings.transfer;
        let io_timeout = self.settings.io_timeout();

        let mut reader = open_part(path, range, transfer.read_buffer_size).await?;
        let mut conn = PeerConnection::new(self.connect().await?, transfer.max_frame_size, io_timeout);

        conn.write_json(&RequestHeader::send_file(transfer_id)).await?;
        conn.write_json(metadata).await?;

        let mut stream = conn.into_inner();
        let mut meter = ThroughputMeter::new(
            format!("Upload speed [{}]", metadata.part_name),
            self.settings.throughput_interval(),
        );
        let sent = write_raw(
            &mut reader,
            &mut stream,
            transfer.read_buffer_size,
            io_timeout,
            |n| {
                meter.record(n);
            },
        )
        .await?;

        if sent != range.length {
            return Err(FileshareError::Transfer(format!(
                "{:?} changed while sending: read {} of {} bytes at offset {}",
                path, sent, range.length, range.offset
            )));
        }

        finish(&mut stream, io_timeout).await?;
        debug!(
            "Sent part {:?} ({})",
            metadata.part_name,
            format_file_size(sent)
        );
        Ok(sent)
    }
}
