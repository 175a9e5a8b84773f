//! Frame transport over a TCP byte stream.
//!
//! Useful for robots behind a serial-to-TCP bridge and for driving a remote
//! simulator. Frames are written and read back-to-back as raw 20-byte
//! records, with no extra framing.
//!
//! A write that finds the socket send buffer full (the peer is not draining
//! the stream) is rejected with [`RoveError::TransportBusy`] before any byte
//! is queued, and the connection postpones it. Once the first byte of a
//! frame is accepted the rest is always flushed, so frames never interleave.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rove_types::{FRAME_LEN, RoveError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::transport::Transport;

pub struct TcpTransport {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<OwnedReadHalf>>,
}

impl TcpTransport {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, RoveError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RoveError::TransportFatal(format!("connect to {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RoveError::TransportFatal(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| RoveError::TransportFatal(e.to_string()))?;
        let (reader, writer) = stream.into_split();
        info!(%peer, "tcp link connected");
        Ok(Self {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&self, frame: [u8; FRAME_LEN]) -> Result<(), RoveError> {
        let fatal = |e: std::io::Error| RoveError::TransportFatal(format!("write to {}: {e}", self.peer));
        let mut writer = self.writer.lock().await;
        match writer.try_write(&frame) {
            Ok(n) if n == FRAME_LEN => Ok(()),
            Ok(n) => writer.write_all(&frame[n..]).await.map_err(fatal),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(RoveError::TransportBusy),
            Err(e) => Err(fatal(e)),
        }
    }

    async fn notifications(&self) -> BoxStream<'static, Vec<u8>> {
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(reader) = reader else {
            return stream::empty().boxed();
        };
        stream::unfold(reader, |mut reader| async move {
            let mut buf = [0u8; FRAME_LEN];
            match reader.read_exact(&mut buf).await {
                Ok(_) => Some((buf.to_vec(), reader)),
                Err(e) => {
                    debug!(error = %e, "tcp link closed");
                    None
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rove_types::Frame;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_round_trip_through_an_echo_peer() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let mut buf = [0u8; FRAME_LEN];
            socket.read_exact(&mut buf).await?;
            socket.write_all(&buf).await?;
            Ok::<_, std::io::Error>(())
        });

        let link = TcpTransport::connect(&addr.to_string()).await?;
        let mut notifications = link.notifications().await;
        let frame = Frame::new(1, 16, 3, &[])?;
        link.write(frame.encode()).await?;

        let bytes = notifications.next().await.ok_or("no echo")?;
        assert_eq!(Frame::decode(&bytes)?, frame);
        echo.await??;

        assert!(notifications.next().await.is_none(), "peer hung up");
        Ok(())
    }

    #[tokio::test]
    async fn full_send_buffer_reports_busy() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let link = TcpTransport::connect(&addr.to_string()).await?;
        // Accepted but never read.
        let (_peer, _) = listener.accept().await?;

        let frame = Frame::new(1, 4, 0, &[0, 0, 0, 80, 0, 0, 0, 80])?.encode();
        let mut accepted = 0u32;
        let mut busy = None;
        for _ in 0..1_000_000 {
            match tokio::time::timeout(Duration::from_millis(200), link.write(frame)).await {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(err)) => {
                    busy = Some(err);
                    break;
                }
                // A frame that only partly fit waits for room; the next write
                // finds the buffer full.
                Err(_) => {}
            }
        }
        assert_eq!(busy, Some(RoveError::TransportBusy));
        assert!(accepted > 0);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        let result = TcpTransport::connect(&addr.to_string()).await;
        assert!(matches!(result, Err(RoveError::TransportFatal(_))));
        Ok(())
    }
}
