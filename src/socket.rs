//! Transport abstraction for established connections
//!
//! The engine runs over any byte-oriented duplex stream: a plain TCP
//! socket, TLS over TCP, or a hijacked HTTP upgrade stream. The write side
//! carries a `close_after_write` hint: when set, the stream is shut down as
//! soon as the currently pending write completes. The hint is best-effort —
//! the engine always issues an explicit shutdown as fallback, so transports
//! that cannot honor it still close.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};

use crate::send::WireMessage;

/// Marker trait for transports the engine can drive
///
/// Blanket-implemented for every async duplex stream.
pub trait Duplex: tokio::io::AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: tokio::io::AsyncRead + AsyncWrite + Send + Unpin> Duplex for S {}

/// Write side of a connection's transport
///
/// Owns the stream's write half plus the `close_after_write` flag.
pub struct WriteSocket<S> {
    inner: WriteHalf<S>,
    close_after_write: bool,
    shut_down: bool,
}

impl<S: Duplex> WriteSocket<S> {
    pub(crate) fn new(inner: WriteHalf<S>) -> Self {
        Self {
            inner,
            close_after_write: false,
            shut_down: false,
        }
    }

    /// Request that the stream closes once the next write completes
    pub fn set_close_after_write(&mut self) {
        self.close_after_write = true;
    }

    /// Write a finalized message's wire bytes in order
    ///
    /// Honors `close_after_write` after the final chunk.
    pub async fn write_message(&mut self, message: &WireMessage) -> io::Result<()> {
        if self.shut_down {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already shut down",
            ));
        }

        for chunk in message.chunks() {
            self.inner.write_all(chunk).await?;
        }
        self.inner.flush().await?;

        if self.close_after_write {
            self.shutdown().await?;
        }
        Ok(())
    }

    /// Write raw bytes (handshake responses, preformatted control frames)
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.shut_down {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already shut down",
            ));
        }

        self.inner.write_all(data).await?;
        self.inner.flush().await?;

        if self.close_after_write {
            self.shutdown().await?;
        }
        Ok(())
    }

    /// Close the write side
    ///
    /// `abort` skips the graceful shutdown and simply marks the stream
    /// dead; the underlying descriptor is released when both halves drop.
    pub async fn close(&mut self, abort: bool) {
        if abort {
            self.shut_down = true;
        } else {
            let _ = self.shutdown().await;
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        if !self.shut_down {
            self.shut_down = true;
            self.inner.shutdown().await?;
        }
        Ok(())
    }
}
