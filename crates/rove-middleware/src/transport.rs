//! The link seam.
//!
//! The connection never talks to a radio or a socket directly. It writes
//! whole frames through a [`Transport`] and consumes the transport's
//! notification stream.
//!
//! # Implementations
//!
//! - [`SimRobot`][crate::sim::SimRobot] – in-process robot model for tests
//!   and offline sessions.
//! - [`TcpTransport`][crate::tcp::TcpTransport] – 20-byte frames carried back
//!   to back over a TCP byte stream to a serial/BLE bridge.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rove_types::{FRAME_LEN, RoveError};

/// A notify/write characteristic pair.
///
/// # Contract
///
/// * `write` – hand one encoded frame to the link. Returns
///   [`RoveError::TransportBusy`] when the link rejects the write because
///   another operation is in progress (the caller retries), and
///   [`RoveError::TransportFatal`] when the link is gone.
///
/// * `notifications` – the stream of raw inbound notifications. The stream
///   ending means the link closed. Implementations may only hand out one live
///   stream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, frame: [u8; FRAME_LEN]) -> Result<(), RoveError>;

    async fn notifications(&self) -> BoxStream<'static, Vec<u8>>;
}
