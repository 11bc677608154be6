//! Length-prefixed framing for the structured part of a connection.
//!
//! Every connection starts with one or two frames (an 8-byte big-endian
//! length followed by a JSON payload). Whatever follows the last frame is a
//! raw byte stream that ends when the peer shuts down its write side.

use crate::{FileshareError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Chain};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError};
use tracing::debug;

pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Anything the codec can run over: a TCP stream in production, an
/// in-memory duplex pipe in tests.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Raw remainder of a connection: bytes the framer already buffered,
/// followed by the unread socket.
pub type RawBody<C> = Chain<Cursor<BytesMut>, C>;

pub fn frame_codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_SIZE)
        .big_endian()
        .max_frame_length(max_frame_size)
        .new_codec()
}

pub struct PeerConnection<C> {
    framed: Framed<C, LengthDelimitedCodec>,
    io_timeout: Duration,
}

impl<C: Connection> PeerConnection<C> {
    pub fn new(stream: C, max_frame_size: usize, io_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec(max_frame_size)),
            io_timeout,
        }
    }

    pub async fn write_frame(&mut self, payload: Bytes) -> Result<()> {
        let len = payload.len();
        timeout(self.io_timeout, self.framed.send(payload))
            .await
            .map_err(|_| FileshareError::Timeout("writing frame"))?
            .map_err(map_codec_error)?;

        debug!("Wrote frame of {} bytes", len);
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<BytesMut> {
        match timeout(self.io_timeout, self.framed.next()).await {
            Err(_) => Err(FileshareError::Timeout("reading frame")),
            Ok(None) => Err(FileshareError::Network(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a complete frame arrived",
            ))),
            Ok(Some(Err(e))) => Err(map_codec_error(e)),
            Ok(Some(Ok(frame))) => {
                debug!("Read frame of {} bytes", frame.len());
                Ok(frame)
            }
        }
    }

    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_frame(Bytes::from(payload)).await
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.read_frame().await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Leaves frame mode for reading the raw remainder of the stream.
    pub fn into_body(self) -> RawBody<C> {
        let parts = self.framed.into_parts();
        Cursor::new(parts.read_buf).chain(parts.io)
    }

    /// Leaves frame mode for writing the raw remainder of the stream. Every
    /// frame has been flushed by the time `write_frame` returns.
    pub fn into_inner(self) -> C {
        self.framed.into_inner()
    }
}

/// One read from a raw body. `Ok(0)` means the peer closed its write side.
pub async fn read_raw<R>(body: &mut R, buf: &mut [u8], io_timeout: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let n = timeout(io_timeout, body.read(buf))
        .await
        .map_err(|_| FileshareError::Timeout("reading stream"))??;
    Ok(n)
}

/// Copies `reader` to `stream` until the reader is exhausted, calling
/// `on_chunk` after every write. Returns the number of bytes written.
pub async fn write_raw<R, W, F>(
    reader: &mut R,
    stream: &mut W,
    buffer_size: usize,
    io_timeout: Duration,
    mut on_chunk: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; buffer_size];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        timeout(io_timeout, stream.write_all(&buf[..n]))
            .await
            .map_err(|_| FileshareError::Timeout("writing stream"))??;
        written += n as u64;
        on_chunk(n);
    }

    timeout(io_timeout, stream.flush())
        .await
        .map_err(|_| FileshareError::Timeout("flushing stream"))??;
    Ok(written)
}

/// Closes the write side so the peer reads end-of-stream.
pub async fn finish<W>(stream: &mut W, io_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(io_timeout, stream.shutdown())
        .await
        .map_err(|_| FileshareError::Timeout("closing stream"))??;
    Ok(())
}

fn map_codec_error(e: std::io::Error) -> FileshareError {
    let oversized = e
        .get_ref()
        .map(|inner| inner.is::<LengthDelimitedCodecError>())
        .unwrap_or(false);

    if oversized {
        FileshareError::FrameTooLarge
    } else {
        FileshareError::Network(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{RequestHeader, RequestType};
    use tokio::io::duplex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_frames_then_raw_body() {
        let (client, server) = duplex(64 * 1024);
        let header = RequestHeader::send_string();

        let writer = tokio::spawn({
            let header = header.clone();
            async move {
                let mut conn = PeerConnection::new(client, 1024, TIMEOUT);
                conn.write_json(&header).await.unwrap();
                let mut stream = conn.into_inner();
                let mut payload: &[u8] = b"hello";
                let sent = write_raw(&mut payload, &mut stream, 2, TIMEOUT, |_| {})
                    .await
                    .unwrap();
                assert_eq!(sent, 5);
                finish(&mut stream, TIMEOUT).await.unwrap();
            }
        });

        let mut conn = PeerConnection::new(server, 1024, TIMEOUT);
        let received: RequestHeader = conn.read_json().await.unwrap();
        assert_eq!(received.request_type, RequestType::SendString);
        assert_eq!(received.transfer_id, header.transfer_id);

        let mut body = conn.into_body();
        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = read_raw(&mut body, &mut buf, TIMEOUT).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello");

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_body_bytes_buffered_with_frame_are_kept() {
        let (mut client, server) = duplex(1024);
        let mut wire = Vec::new();
        wire.extend_from_slice(&2u64.to_be_bytes());
        wire.extend_from_slice(b"{}");
        wire.extend_from_slice(b"payload");
        client.write_all(&wire).await.unwrap();
        drop(client);

        let mut conn = PeerConnection::new(server, 1024, TIMEOUT);
        assert_eq!(&conn.read_frame().await.unwrap()[..], b"{}");

        let mut body = Vec::new();
        conn.into_body().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn test_length_prefix_is_eight_bytes_big_endian() {
        let (client, mut server) = duplex(1024);

        let mut conn = PeerConnection::new(client, 1024, TIMEOUT);
        conn.write_frame(Bytes::from_static(b"abc")).await.unwrap();
        drop(conn);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_without_allocation() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(&0x7FFF_FFFF_FFFF_FFFFu64.to_be_bytes())
            .await
            .unwrap();

        let mut conn = PeerConnection::new(server, 1024, TIMEOUT);
        let result = conn.read_frame().await;
        assert!(matches!(result, Err(FileshareError::FrameTooLarge)));
    }

    #[tokio::test]
    async fn test_oversized_payload_refused_by_writer() {
        let (client, _server) = duplex(1024);
        let mut conn = PeerConnection::new(client, 4, TIMEOUT);

        let result = conn.write_frame(Bytes::from_static(b"too long")).await;
        assert!(matches!(result, Err(FileshareError::FrameTooLarge)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_network_error() {
        let (mut client, server) = duplex(1024);
        client.write_all(&10u64.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut conn = PeerConnection::new(server, 1024, TIMEOUT);
        assert!(matches!(
            conn.read_frame().await,
            Err(FileshareError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let (_client, server) = duplex(1024);
        let mut conn = PeerConnection::new(server, 1024, Duration::from_millis(50));

        assert!(matches!(
            conn.read_frame().await,
            Err(FileshareError::Timeout(_))
        ));
    }
}
