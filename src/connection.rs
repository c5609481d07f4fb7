//! The per-connection protocol engine
//!
//! One [`Connection`] drives a single upgraded stream: the receive loop
//! with control-frame handling, the RFC 6455 close handshake in both
//! directions, serialized sends and abortive teardown.
//!
//! ## Concurrency
//!
//! The stream is split into read and write halves, each behind a tokio
//! mutex. The write-half lock has a FIFO waiter queue, so sends complete in
//! call order and bytes of two messages never interleave. The read half is
//! taken with `try_lock`: a second concurrent receive fails fast instead of
//! silently interleaving. Small shared state (the state machine, close
//! bookkeeping and the lazily created codecs) lives under a sync lock that
//! is never held across an await point.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::deflate::{Deflater, Inflater};
use crate::error::{CloseCode, Error, Result};
use crate::frame::{FrameHeader, OpCode};
use crate::id;
use crate::mask::{apply_mask, apply_mask_offset, MaskRng};
use crate::recv::RecvBuffer;
use crate::send::{Framing, SendBuffer, WireMessage};
use crate::socket::{Duplex, WriteSocket};

/// Connection lifecycle states; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Handshake complete, frames flowing
    Open,
    /// Our close frame is sent; waiting for the peer's
    Closing,
    /// Close handshake completed gracefully
    Closed,
    /// Torn down without a completed close handshake
    Aborted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Immutable per-connection flags set from the negotiated handshake
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    /// Server side (receives masked frames, sends unmasked)
    pub server: bool,
    /// `permessage-deflate` was negotiated
    pub deflate: bool,
}

/// A received data message
#[derive(Debug, Clone)]
pub enum Message {
    /// UTF-8 text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// Payload bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Text payload; `None` for binary messages
    ///
    /// Text messages are UTF-8 validated before delivery.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Consume into the payload bytes
    #[inline]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Whether this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }
}

type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    close_sent: bool,
    close_received: bool,
    close_code: Option<u16>,
    close_description: Option<String>,
    /// Lazily created codecs; dropped exactly once on entering a terminal
    /// state. Buffers hold them through the `Arc` while in use.
    deflater: Option<Arc<Mutex<Deflater>>>,
    inflater: Option<Arc<Mutex<Inflater>>>,
}

struct Shared {
    id: String,
    flags: Flags,
    inner: Mutex<Inner>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    on_exception: Mutex<Option<ExceptionHandler>>,
}

struct SendHalf<S> {
    socket: WriteSocket<S>,
    buffer: SendBuffer,
    mask_rng: MaskRng,
}

struct RecvHalf<S> {
    reader: ReadHalf<S>,
    scratch: BytesMut,
    buffer: RecvBuffer,
}

/// One WebSocket connection
///
/// Cheap to clone; clones share the connection and can be moved into
/// separate send and receive tasks.
pub struct Connection<S> {
    shared: Arc<Shared>,
    send_half: Arc<AsyncMutex<SendHalf<S>>>,
    recv_half: Arc<AsyncMutex<RecvHalf<S>>>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            send_half: self.send_half.clone(),
            recv_half: self.recv_half.clone(),
        }
    }
}

impl<S: Duplex + 'static> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<S: Duplex + 'static> Connection<S> {
    /// Wrap an already-upgraded stream
    ///
    /// `leftover` carries any bytes read past the end of the HTTP upgrade;
    /// they are replayed ahead of the stream.
    pub fn from_upgraded(
        stream: S,
        flags: Flags,
        max_message_size: usize,
        leftover: Bytes,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed_tx, closed_rx) = watch::channel(false);
        let id = id::next_id();

        debug!(
            id = %id,
            server = flags.server,
            deflate = flags.deflate,
            peer = ?peer,
            "websocket connection created"
        );

        let mut scratch = BytesMut::with_capacity(crate::SEGMENT_SIZE);
        scratch.extend_from_slice(&leftover);

        Self {
            shared: Arc::new(Shared {
                id,
                flags,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Open,
                    close_sent: false,
                    close_received: false,
                    close_code: None,
                    close_description: None,
                    deflater: None,
                    inflater: None,
                }),
                closed_tx,
                closed_rx,
                on_exception: Mutex::new(None),
            }),
            send_half: Arc::new(AsyncMutex::new(SendHalf {
                socket: WriteSocket::new(writer),
                buffer: SendBuffer::new(Framing::Frame),
                mask_rng: MaskRng::new(),
            })),
            recv_half: Arc::new(AsyncMutex::new(RecvHalf {
                reader,
                scratch,
                buffer: RecvBuffer::new(max_message_size),
            })),
        }
    }

    /// Correlation id for log events
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Connection flags negotiated at handshake
    pub fn flags(&self) -> Flags {
        self.shared.flags
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Close status code received from or sent to the peer, if any
    pub fn close_code(&self) -> Option<u16> {
        self.shared.inner.lock().close_code
    }

    /// Close description, if any
    pub fn close_description(&self) -> Option<String> {
        self.shared.inner.lock().close_description.clone()
    }

    /// Install a callback invoked for non-I/O engine errors
    ///
    /// I/O errors are expected on peer disconnect and are only logged.
    pub fn set_exception_handler(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        *self.shared.on_exception.lock() = Some(Arc::new(handler));
    }

    /// A signal that fires once the connection reaches a terminal state
    ///
    /// Useful for racing application I/O against connection teardown.
    pub fn closed_token(&self) -> watch::Receiver<bool> {
        self.shared.closed_rx.clone()
    }

    /// Wait until the connection reaches `Closed` or `Aborted`
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a text message
    ///
    /// Returns false when the connection no longer accepts sends or the
    /// send failed; failures abort the connection and are never surfaced
    /// as errors.
    pub async fn send_text(&self, text: &str) -> bool {
        self.send_data(OpCode::Text, text.as_bytes()).await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: &[u8]) -> bool {
        self.send_data(OpCode::Binary, data).await
    }

    async fn send_data(&self, opcode: OpCode, data: &[u8]) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }

        let deflater = self.deflater_handle();
        let mut half = self.send_half.lock().await;

        // The state may have moved while queued behind other sends.
        if self.state() != ConnectionState::Open {
            self.honor_abort(&mut half).await;
            return false;
        }

        let framed = frame_into(
            &mut half,
            self.shared.flags.server,
            opcode,
            data,
            deflater.as_deref(),
        );
        let result = match framed {
            Ok(message) => {
                trace!(
                    id = %self.shared.id,
                    opcode = ?opcode,
                    wire_len = message.wire_len(),
                    "send"
                );
                half.socket.write_message(&message).await.map_err(Error::Io)
            }
            Err(err) => Err(Error::Io(err)),
        };

        match result {
            Ok(()) => {
                self.honor_abort(&mut half).await;
                true
            }
            Err(err) => {
                half.buffer.reset();
                self.honor_abort(&mut half).await;
                drop(half);
                self.handle_failure(err).await;
                false
            }
        }
    }

    /// Send a close frame through the serialized send chain
    async fn send_close_frame(&self, payload: &[u8], close_after_write: bool) -> bool {
        let mut half = self.send_half.lock().await;

        let framed = frame_into(&mut half, self.shared.flags.server, OpCode::Close, payload, None);
        let result = match framed {
            Ok(message) => {
                if close_after_write {
                    half.socket.set_close_after_write();
                }
                half.socket.write_message(&message).await.map_err(Error::Io)
            }
            Err(err) => Err(Error::Io(err)),
        };

        match result {
            Ok(()) => {
                self.honor_abort(&mut half).await;
                true
            }
            Err(err) => {
                half.buffer.reset();
                self.honor_abort(&mut half).await;
                drop(half);
                self.handle_failure(err).await;
                false
            }
        }
    }

    /// Send a pong reply; preformatted on the server, masked on the client
    async fn send_pong(&self) -> bool {
        const SERVER_PONG: [u8; 2] = [0x8A, 0x00];

        let mut half = self.send_half.lock().await;

        let result = if self.shared.flags.server {
            half.socket.write_all(&SERVER_PONG).await
        } else {
            let mask = half.mask_rng.next_mask();
            let frame = [0x8A, 0x80, mask[0], mask[1], mask[2], mask[3]];
            half.socket.write_all(&frame).await
        };

        match result {
            Ok(()) => {
                self.honor_abort(&mut half).await;
                true
            }
            Err(err) => {
                self.honor_abort(&mut half).await;
                drop(half);
                self.handle_failure(Error::Io(err)).await;
                false
            }
        }
    }

    /// Act on a pending abort before releasing the send lock
    ///
    /// `abort()` closes the stream only when the lock is free, so every
    /// lock holder checks on its way out; one of the two always runs and
    /// the abortive close is guaranteed.
    async fn honor_abort(&self, half: &mut SendHalf<S>) {
        if self.state() == ConnectionState::Aborted {
            half.socket.close(true).await;
        }
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Receive the next data message
    ///
    /// Control frames are handled internally. Returns `Ok(None)` once the
    /// connection has terminated, gracefully or not; receive-side failures
    /// abort the connection instead of surfacing. The only error is
    /// [`Error::ReceiveInProgress`] when another receive is outstanding.
    pub async fn recv(&self) -> Result<Option<Message>> {
        if self.state() >= ConnectionState::Closed {
            return Ok(None);
        }

        let mut half = self
            .recv_half
            .try_lock()
            .map_err(|_| Error::ReceiveInProgress)?;

        match self.recv_message(&mut half).await {
            Ok(message) => Ok(message),
            Err(err) => {
                half.buffer.reset();
                drop(half);
                self.recv_failure(err).await;
                Ok(None)
            }
        }
    }

    /// Drive the receive loop until one message is complete
    async fn recv_message(&self, half: &mut RecvHalf<S>) -> Result<Option<Message>> {
        loop {
            if self.state() >= ConnectionState::Closed {
                return Ok(None);
            }

            let header = self.read_header(half).await?;
            trace!(
                id = %self.shared.id,
                opcode = ?header.opcode,
                len = header.payload_len,
                fin = header.fin,
                compressed = header.compressed,
                "recv frame"
            );

            if !half.buffer.in_message() {
                match header.opcode {
                    OpCode::Ping => {
                        if header.payload_len > 0 {
                            return Err(Error::Protocol("ping with payload"));
                        }
                        self.send_pong().await;
                        continue;
                    }
                    OpCode::Pong => {
                        self.read_control_payload(half, &header).await?;
                        continue;
                    }
                    OpCode::Close => return self.on_close_frame(half, &header).await,
                    OpCode::Text | OpCode::Binary => {
                        half.buffer.begin(header.opcode, header.compressed);
                    }
                    OpCode::Continuation => return Err(Error::UnexpectedFrame),
                }
            } else {
                if header.opcode != OpCode::Continuation {
                    return Err(Error::UnexpectedFrame);
                }
                if header.compressed {
                    return Err(Error::Protocol("RSV1 on continuation frame"));
                }
            }

            if !half.buffer.compressed() && half.buffer.would_overflow(header.payload_len) {
                return Err(Error::MessageTooLarge);
            }

            self.read_payload(half, &header).await?;

            if header.fin {
                half.buffer.mark_success();

                let inflater = self.inflater_handle();
                let (kind, payload) = match &inflater {
                    Some(arc) => half.buffer.finish(Some(&mut arc.lock()))?,
                    None => half.buffer.finish(None)?,
                };

                let message = match kind {
                    OpCode::Text => {
                        if std::str::from_utf8(&payload).is_err() {
                            return Err(Error::InvalidUtf8);
                        }
                        Message::Text(payload)
                    }
                    _ => Message::Binary(payload),
                };

                debug!(
                    id = %self.shared.id,
                    kind = ?kind,
                    len = message.as_bytes().len(),
                    "recv message"
                );
                return Ok(Some(message));
            }
        }
    }

    /// Read one frame header from the stream
    async fn read_header(&self, half: &mut RecvHalf<S>) -> Result<FrameHeader> {
        self.fill_scratch(half, 2).await?;
        let needed = FrameHeader::size_from_prefix(half.scratch[1]);
        self.fill_scratch(half, needed).await?;

        let header = FrameHeader::decode(
            &half.scratch[..needed],
            self.shared.flags.server,
            self.shared.flags.deflate,
        )?;
        half.scratch.advance(needed);
        Ok(header)
    }

    /// Buffer stream bytes until `n` are available
    async fn fill_scratch(&self, half: &mut RecvHalf<S>, n: usize) -> Result<()> {
        while half.scratch.len() < n {
            half.scratch.reserve(crate::SEGMENT_SIZE);
            let read = half.reader.read_buf(&mut half.scratch).await?;
            if read == 0 {
                // Peer dropped the transport without a close handshake.
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the stream mid-frame",
                )));
            }
        }
        Ok(())
    }

    /// Stream one frame's payload into the receive buffer
    async fn read_payload(&self, half: &mut RecvHalf<S>, header: &FrameHeader) -> Result<()> {
        let inflater = if half.buffer.compressed() {
            self.inflater_handle()
        } else {
            None
        };

        let mut remaining = header.payload_len;
        let mut unmask_offset = 0usize;

        while remaining > 0 {
            if half.scratch.is_empty() {
                self.fill_scratch(half, 1).await?;
            }

            let take = (half.scratch.len() as u64).min(remaining) as usize;
            let mut chunk = half.scratch.split_to(take);

            if let Some(mask) = header.mask {
                apply_mask_offset(&mut chunk, mask, unmask_offset);
            }
            unmask_offset += take;

            match &inflater {
                Some(arc) => half.buffer.write(&chunk, Some(&mut arc.lock()))?,
                None => half.buffer.write(&chunk, None)?,
            }

            remaining -= take as u64;
        }
        Ok(())
    }

    /// Read and unmask a control frame payload (at most 125 bytes)
    async fn read_control_payload(
        &self,
        half: &mut RecvHalf<S>,
        header: &FrameHeader,
    ) -> Result<Vec<u8>> {
        let len = header.payload_len as usize;
        self.fill_scratch(half, len).await?;

        let mut payload = half.scratch.split_to(len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        Ok(payload.to_vec())
    }

    // ========================================================================
    // Close handshake
    // ========================================================================

    /// Close the connection gracefully
    ///
    /// Sends a close frame with `code` and `description` after all queued
    /// sends, then waits in the background for the peer's close before the
    /// connection reaches `Closed`. No-op unless the state is `Open`.
    pub async fn close(&self, code: CloseCode, description: &str) {
        let peer_close_pending = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Open {
                return;
            }
            self.transition(&mut inner, ConnectionState::Closing);
            inner.close_sent = true;
            inner.close_code = Some(code.as_u16());
            if !description.is_empty() {
                inner.close_description = Some(description.to_string());
            }
            !inner.close_received
        };

        let mut payload = Vec::with_capacity(2 + description.len());
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        payload.extend_from_slice(description.as_bytes());

        debug!(id = %self.shared.id, code = code.as_u16(), "close handshake started");
        if !self.send_close_frame(&payload, false).await {
            return;
        }

        if peer_close_pending {
            let conn = self.clone();
            tokio::spawn(async move { conn.drain_until_peer_close().await });
        } else {
            self.finish_close().await;
        }
    }

    /// Handle the peer's close frame arriving on the receive path
    async fn on_close_frame(
        &self,
        half: &mut RecvHalf<S>,
        header: &FrameHeader,
    ) -> Result<Option<Message>> {
        let payload = self.read_control_payload(half, header).await?;

        if payload.len() == 1 {
            return Err(Error::Protocol("close frame with one-byte payload"));
        }

        let code = if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_wire_code(code) {
                return Err(Error::Protocol("invalid close status code"));
            }
            Some(code)
        } else {
            None
        };

        let description = if payload.len() > 2 {
            let text = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
            Some(text.to_string())
        } else {
            None
        };

        let reflect = {
            let mut inner = self.shared.inner.lock();
            inner.close_received = true;
            if inner.close_code.is_none() {
                inner.close_code = code;
                inner.close_description = description;
            }

            if inner.close_sent {
                // We initiated; the peer's close completes the handshake.
                self.transition(&mut inner, ConnectionState::Closed);
                false
            } else {
                self.transition(&mut inner, ConnectionState::Closing);
                true
            }
        };

        if reflect {
            // Echo the peer's status back without a description; the stream
            // closes itself once the reflected frame is written.
            let mut payload = Vec::with_capacity(2);
            if let Some(code) = code {
                payload.extend_from_slice(&code.to_be_bytes());
            }

            debug!(id = %self.shared.id, code = ?code, "reflecting close");
            {
                let mut inner = self.shared.inner.lock();
                inner.close_sent = true;
            }
            if self.send_close_frame(&payload, true).await {
                let mut inner = self.shared.inner.lock();
                self.transition(&mut inner, ConnectionState::Closed);
            }
        } else {
            self.finish_close().await;
        }

        Ok(None)
    }

    /// Drain frames until the peer's close arrives (close-initiator side)
    async fn drain_until_peer_close(&self) {
        let mut half = match self.recv_half.try_lock() {
            Ok(half) => half,
            // A user receive is outstanding; its loop observes the close.
            Err(_) => return,
        };

        loop {
            if self.state() >= ConnectionState::Closed {
                return;
            }

            let header = match self.read_header(&mut half).await {
                Ok(header) => header,
                Err(err) => {
                    drop(half);
                    self.recv_failure(err).await;
                    return;
                }
            };

            if header.opcode != OpCode::Close {
                drop(half);
                self.recv_failure(Error::Protocol("non-close frame while closing")).await;
                return;
            }

            match self.on_close_frame(&mut half, &header).await {
                Ok(_) => return,
                Err(err) => {
                    drop(half);
                    self.recv_failure(err).await;
                    return;
                }
            }
        }
    }

    /// Gracefully shut the stream down after a completed close handshake
    async fn finish_close(&self) {
        // Queued sends short-circuit on the terminal state, so the lock
        // frees up promptly.
        let mut half = self.send_half.lock().await;
        half.socket.close(false).await;
    }

    /// Abort the connection
    ///
    /// The stream is torn down without completing the close handshake:
    /// immediately when the send lock is free, otherwise by the current
    /// lock holder before it releases the lock.
    pub async fn abort(&self, reason: &str) {
        let transitioned = {
            let mut inner = self.shared.inner.lock();
            if inner.state >= ConnectionState::Closed {
                false
            } else {
                if inner.close_description.is_none() && !reason.is_empty() {
                    inner.close_description = Some(reason.to_string());
                }
                self.transition(&mut inner, ConnectionState::Aborted);
                true
            }
        };

        if transitioned {
            debug!(id = %self.shared.id, reason, "connection aborted");
            if let Ok(mut half) = self.send_half.try_lock() {
                half.socket.close(true).await;
            }
        }
    }

    // ========================================================================
    // Failure handling and state
    // ========================================================================

    /// Convert a receive-path error into a protocol close and an abort
    async fn recv_failure(&self, err: Error) {
        // Best-effort status frame before tearing down; skipped when a
        // close frame is already out (the state no longer admits one).
        let status = match err.close_code() {
            Some(code) => {
                let mut inner = self.shared.inner.lock();
                if inner.state == ConnectionState::Open {
                    self.transition(&mut inner, ConnectionState::Closing);
                    inner.close_sent = true;
                    inner.close_code = Some(code.as_u16());
                    Some(code)
                } else {
                    None
                }
            }
            None => None,
        };

        if let Some(code) = status {
            self.send_close_frame(&code.as_u16().to_be_bytes(), true).await;
        }

        self.handle_failure(err).await;
    }

    /// Common failure path: log or surface, then abort
    async fn handle_failure(&self, err: Error) {
        if self.state() >= ConnectionState::Closed {
            return;
        }

        if err.is_io() {
            debug!(id = %self.shared.id, error = %err, "i/o failure");
        } else {
            debug!(id = %self.shared.id, error = %err, "engine failure");
            let handler = self.shared.on_exception.lock().clone();
            if let Some(handler) = handler {
                handler(&err);
            }
        }

        self.abort(&err.to_string()).await;
    }

    /// Move the state machine forward; entering a terminal state releases
    /// the codecs and wakes `closed()` waiters off this call stack. The
    /// stream itself is closed by `finish_close` on the graceful path and
    /// by `abort`/`honor_abort` on the abortive one.
    fn transition(&self, inner: &mut Inner, to: ConnectionState) {
        if to <= inner.state || inner.state >= ConnectionState::Closed {
            return;
        }

        debug!(id = %self.shared.id, from = %inner.state, to = %to, "state transition");
        inner.state = to;

        if to >= ConnectionState::Closed {
            inner.deflater = None;
            inner.inflater = None;

            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.closed_tx.send_replace(true);
            });
        }
    }

    /// Lazily created deflate stream; `None` once the connection is closed
    fn deflater_handle(&self) -> Option<Arc<Mutex<Deflater>>> {
        if !self.shared.flags.deflate {
            return None;
        }
        let mut inner = self.shared.inner.lock();
        if inner.state >= ConnectionState::Closed {
            return None;
        }
        Some(
            inner
                .deflater
                .get_or_insert_with(|| Arc::new(Mutex::new(Deflater::new())))
                .clone(),
        )
    }

    /// Lazily created inflate stream; `None` once the connection is closed
    fn inflater_handle(&self) -> Option<Arc<Mutex<Inflater>>> {
        if !self.shared.flags.deflate {
            return None;
        }
        let mut inner = self.shared.inner.lock();
        if inner.state >= ConnectionState::Closed {
            return None;
        }
        Some(
            inner
                .inflater
                .get_or_insert_with(|| Arc::new(Mutex::new(Inflater::new())))
                .clone(),
        )
    }
}

/// Accumulate and finalize one outgoing message under the send lock
///
/// The deflate guard is scoped to the synchronous framing work and released
/// before any stream write.
fn frame_into<S: Duplex>(
    half: &mut SendHalf<S>,
    server: bool,
    opcode: OpCode,
    data: &[u8],
    deflater: Option<&Mutex<Deflater>>,
) -> std::io::Result<WireMessage> {
    let mask = if server {
        None
    } else {
        Some(half.mask_rng.next_mask())
    };

    match deflater {
        // Control frames are never compressed.
        Some(deflater) if opcode.is_data() => {
            let mut guard = deflater.lock();
            half.buffer.write(data, Some(&mut guard))?;
            half.buffer.finish(opcode, Some(&mut guard), mask)
        }
        _ => {
            half.buffer.write(data, None)?;
            half.buffer.finish(opcode, None, mask)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connect_stream;
    use crate::server::Acceptor;
    use crate::Options;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Handshake a client/server connection pair over an in-memory duplex
    async fn pair(options: Options) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);

        let acceptor = Acceptor::new(options.clone());
        let server_task =
            tokio::spawn(async move { acceptor.accept(server_io, None).await.unwrap() });

        let client = connect_stream(client_io, "example.com", "/", options)
            .await
            .unwrap();
        (client, server_task.await.unwrap())
    }

    /// A server-side connection driven by hand-written wire bytes
    fn raw_server(max_message_size: usize) -> (Connection<DuplexStream>, DuplexStream) {
        let (server_io, raw_io) = tokio::io::duplex(256 * 1024);
        let conn = Connection::from_upgraded(
            server_io,
            Flags {
                server: true,
                deflate: false,
            },
            max_message_size,
            Bytes::new(),
            None,
        );
        (conn, raw_io)
    }

    /// Client frames in the tests use a zero mask: the mask bit is set but
    /// the payload bytes stay readable.
    fn masked_frame(b0: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 125);
        let mut frame = vec![b0, 0x80 | payload.len() as u8, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn loopback_echo_text() {
        let (client, server) = pair(Options::default()).await;

        assert!(client.send_text("Hello").await);

        let msg = server.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("Hello"));

        assert!(server.send_text(msg.as_text().unwrap()).await);

        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(echoed.as_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn loopback_echo_binary() {
        let (client, server) = pair(Options::default()).await;
        let data: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();

        assert!(client.send_binary(&data).await);
        let msg = server.recv().await.unwrap().unwrap();
        assert!(!msg.is_text());
        assert_eq!(msg.as_bytes(), &data[..]);
    }

    #[tokio::test]
    async fn deflate_round_trip_both_directions() {
        let options = Options::builder().enable_message_compression(true).build();
        let (client, server) = pair(options).await;
        assert!(client.flags().deflate && server.flags().deflate);

        let original = "ab".repeat(10_000);

        assert!(client.send_text(&original).await);
        let msg = server.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some(original.as_str()));

        assert!(server.send_text(msg.as_text().unwrap()).await);
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(echoed.as_text(), Some(original.as_str()));
    }

    #[tokio::test]
    async fn deflate_context_carries_across_messages() {
        let options = Options::builder().enable_message_compression(true).build();
        let (client, server) = pair(options).await;

        for i in 0..5 {
            let text = format!("message number {} with shared history", i);
            assert!(client.send_text(&text).await);
            let msg = server.recv().await.unwrap().unwrap();
            assert_eq!(msg.as_text(), Some(text.as_str()));
        }
    }

    #[tokio::test]
    async fn fragmented_text_reassembles() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&masked_frame(0x01, b"Hel")).await.unwrap(); // Text, FIN=0
        raw.write_all(&masked_frame(0x80, b"lo")).await.unwrap(); // Continuation, FIN=1

        let msg = server.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn non_continuation_mid_message_closes_1007() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&masked_frame(0x01, b"He")).await.unwrap(); // Text, FIN=0
        raw.write_all(&masked_frame(0x01, b"llo")).await.unwrap(); // Text again: violation

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);

        // The peer got a close frame carrying 1007 before the teardown.
        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0x88, 0x02, 0x03, 0xEF]);
    }

    #[tokio::test]
    async fn unmasked_client_frame_rejected() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&[0x81, 0x05]).await.unwrap();
        raw.write_all(b"Hello").await.unwrap();

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0x88, 0x02, 0x03, 0xEA]); // 1002
    }

    #[tokio::test]
    async fn oversized_message_closes_1009() {
        let (server, mut raw) = raw_server(4);

        raw.write_all(&masked_frame(0x82, b"too big for the cap"))
            .await
            .unwrap();

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0x88, 0x02, 0x03, 0xF1]); // 1009
    }

    #[tokio::test]
    async fn ping_gets_preformatted_pong() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&masked_frame(0x89, b"")).await.unwrap(); // Ping
        raw.write_all(&masked_frame(0x81, b"after")).await.unwrap();

        // The ping is handled inline; recv yields the following message.
        let msg = server.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("after"));

        let mut pong = [0u8; 2];
        raw.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x00]);
    }

    #[tokio::test]
    async fn ping_with_payload_aborts() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&masked_frame(0x89, b"x")).await.unwrap();

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);
    }

    #[tokio::test]
    async fn server_initiated_close_handshake() {
        let (client, server) = pair(Options::default()).await;

        server.close(CloseCode::NormalClosure, "bye").await;
        assert_eq!(server.state(), ConnectionState::Closing);

        // The peer sees the close and recv reports termination.
        assert!(client.recv().await.unwrap().is_none());
        assert_eq!(client.close_code(), Some(1000));
        assert_eq!(client.close_description().as_deref(), Some("bye"));

        // The reflected close completes the handshake on the initiator.
        server.closed().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(client.state(), ConnectionState::Closed);

        let mut token = server.closed_token();
        assert!(*token.borrow_and_update());
    }

    #[tokio::test]
    async fn close_frame_carries_status_and_description() {
        let (server, mut raw) = raw_server(1 << 20);

        server.close(CloseCode::NormalClosure, "bye").await;

        let mut frame = [0u8; 7];
        raw.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, &[0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']);
    }

    #[tokio::test]
    async fn peer_initiated_close_is_reflected() {
        let (server, mut raw) = raw_server(1 << 20);

        let mut payload = vec![0x03, 0xE8];
        payload.extend_from_slice(b"going away");
        raw.write_all(&masked_frame(0x88, &payload)).await.unwrap();

        assert!(server.recv().await.unwrap().is_none());
        server.closed().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.close_code(), Some(1000));
        assert_eq!(server.close_description().as_deref(), Some("going away"));

        // The reflected close echoes the status without a description.
        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire, &[0x88, 0x02, 0x03, 0xE8]);
    }

    #[tokio::test]
    async fn peer_abort_mid_message() {
        let (server, mut raw) = raw_server(1 << 20);

        let exception_seen = Arc::new(AtomicBool::new(false));
        let seen = exception_seen.clone();
        server.set_exception_handler(move |_| seen.store(true, Ordering::SeqCst));

        // Header promises 100 bytes; only 3 arrive before the drop.
        let mut frame = vec![0x82, 0x80 | 100, 0, 0, 0, 0];
        frame.extend_from_slice(b"abc");
        raw.write_all(&frame).await.unwrap();
        drop(raw);

        assert!(server.recv().await.unwrap().is_none());
        server.closed().await;
        assert_eq!(server.state(), ConnectionState::Aborted);

        // I/O failures never reach the exception callback.
        assert!(!exception_seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn non_io_failure_reaches_exception_handler() {
        let (server, mut raw) = raw_server(1 << 20);

        let exception_seen = Arc::new(AtomicBool::new(false));
        let seen = exception_seen.clone();
        server.set_exception_handler(move |_| seen.store(true, Ordering::SeqCst));

        raw.write_all(&masked_frame(0x80, b"orphan")).await.unwrap(); // bare continuation

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);
        assert!(exception_seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sends_never_interleave() {
        let (client, server) = pair(Options::default()).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let payload = format!("message-{:02}-{}", i, "x".repeat(256));
                assert!(client.send_text(&payload).await);
            }));
        }

        let mut received = Vec::new();
        for _ in 0..20 {
            let msg = server.recv().await.unwrap().unwrap();
            received.push(msg.as_text().unwrap().to_string());
        }

        for task in tasks {
            task.await.unwrap();
        }

        // Every message arrives whole; a single interleaved byte would
        // corrupt the frame stream and fail the parse long before this.
        received.sort();
        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg, &format!("message-{:02}-{}", i, "x".repeat(256)));
        }
    }

    #[tokio::test]
    async fn concurrent_receive_fails_fast() {
        let (client, _server) = pair(Options::default()).await;

        let waiting = client.clone();
        let task = tokio::spawn(async move { waiting.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        match client.recv().await {
            Err(Error::ReceiveInProgress) => {}
            other => panic!("expected ReceiveInProgress, got {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn send_after_close_returns_false() {
        let (client, server) = pair(Options::default()).await;

        server.close(CloseCode::NormalClosure, "").await;
        assert!(!server.send_text("too late").await);

        // Client tears down via its recv loop; afterwards its sends refuse too.
        assert!(client.recv().await.unwrap().is_none());
        assert!(!client.send_text("also too late").await);
    }

    #[tokio::test]
    async fn recv_after_termination_returns_none() {
        let (client, server) = pair(Options::default()).await;

        server.close(CloseCode::NormalClosure, "").await;
        assert!(client.recv().await.unwrap().is_none());
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_messages_round_trip() {
        let (client, server) = pair(Options::default()).await;

        assert!(client.send_text("").await);
        let msg = server.recv().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some(""));

        assert!(client.send_binary(b"").await);
        let msg = server.recv().await.unwrap().unwrap();
        assert!(msg.as_bytes().is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_text_closes_1007() {
        let (server, mut raw) = raw_server(1 << 20);

        raw.write_all(&masked_frame(0x81, &[0xFF, 0xFE, 0xFD]))
            .await
            .unwrap();

        assert!(server.recv().await.unwrap().is_none());
        assert_eq!(server.state(), ConnectionState::Aborted);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(&wire[..4], &[0x88, 0x02, 0x03, 0xEF]); // 1007
    }

    #[tokio::test]
    async fn state_is_monotonic_under_double_close() {
        let (client, server) = pair(Options::default()).await;

        server.close(CloseCode::NormalClosure, "first").await;
        // A second close is a no-op in Closing.
        server.close(CloseCode::EndpointUnavailable, "second").await;

        assert!(client.recv().await.unwrap().is_none());
        server.closed().await;
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(client.close_code(), Some(1000));

        // Aborting a closed connection does not regress the state.
        server.abort("late").await;
        assert_eq!(server.state(), ConnectionState::Closed);
    }
}
