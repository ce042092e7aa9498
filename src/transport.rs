//! Outbound side of the byte stream a connection runs over.
//!
//! The engine never blocks on the transport: [`Transport::write`] queues or
//! hands off bytes and reports whether the transport can still accept them.

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{BytesCodec, FramedWrite};

use crate::errors::ConnectionError;

/// A writable, closable byte stream owned by one connection.
pub trait Transport: Send + Sync {
    /// Hand `bytes` to the transport without waiting for them to be written.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the transport no longer accepts
    /// data, or another error describing why the write failed.
    fn write(&self, bytes: Bytes) -> Result<(), ConnectionError>;

    /// Flush anything pending and terminate the stream.
    fn shutdown(&self);
}

/// Items queued for a [`write_loop`].
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    Shutdown,
}

/// A [`Transport`] backed by an unbounded channel drained by [`write_loop`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Create a channel transport and the receiver its writer task drains.
#[must_use]
pub fn channel() -> (ChannelTransport, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTransport { tx }, rx)
}

impl Transport for ChannelTransport {
    fn write(&self, bytes: Bytes) -> Result<(), ConnectionError> {
        self.tx
            .send(Outbound::Frame(bytes))
            .map_err(|_| ConnectionError::Closed)
    }

    fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }
}

/// Write queued frames to `writer` until shutdown is requested or every
/// [`ChannelTransport`] is dropped, then shut the writer down.
///
/// # Errors
///
/// Returns the first I/O error from `writer`. Dropping the receiver at that
/// point makes further [`Transport::write`] calls fail with
/// [`ConnectionError::Closed`].
pub async fn write_loop<W>(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    writer: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BytesCodec::new());
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => SinkExt::<Bytes>::send(&mut sink, bytes).await?,
            Outbound::Shutdown => break,
        }
    }
    SinkExt::<Bytes>::close(&mut sink).await
}
