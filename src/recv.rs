//! Receive buffer: payload accumulation and streaming inflate
//!
//! A [`RecvBuffer`] accumulates the payload of one logical message across
//! its frames. Unmasked wire bytes are either copied straight into the
//! pooled segment chain or, for compressed messages, pushed through the
//! connection's inflate stream; the logical message length only counts
//! inflated output, so the size cap applies to what the user would actually
//! receive. On finish the RFC 7692 `00 00 FF FF` tail is re-appended and
//! inflated before the chain is yielded as one owned payload.

use bytes::{Bytes, BytesMut};

use crate::deflate::{Inflater, TRAILER};
use crate::error::{Error, Result};
use crate::frame::OpCode;
use crate::pool::{self, SegmentChain};

/// Accumulates the payload of one incoming message
pub struct RecvBuffer {
    chain: SegmentChain,
    /// Opcode of the first frame (Text or Binary); None between messages
    kind: Option<OpCode>,
    compressed: bool,
    /// All frames of the message were received
    success: bool,
    /// Logical (inflated) message length
    message_len: usize,
    max_message_size: usize,
}

impl RecvBuffer {
    /// Create a receive buffer enforcing the given message size cap
    pub fn new(max_message_size: usize) -> Self {
        Self {
            chain: SegmentChain::new(),
            kind: None,
            compressed: false,
            success: false,
            message_len: 0,
            max_message_size,
        }
    }

    /// Whether a message is currently being assembled
    #[inline]
    pub fn in_message(&self) -> bool {
        self.kind.is_some()
    }

    /// Opcode of the message being assembled
    #[inline]
    pub fn kind(&self) -> Option<OpCode> {
        self.kind
    }

    /// Whether the current message is compressed
    #[inline]
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// Logical length accumulated so far
    #[inline]
    pub fn message_len(&self) -> usize {
        self.message_len
    }

    /// Whether `additional` more payload bytes would exceed the size cap
    ///
    /// Used to refuse an uncompressed frame from its header, before any
    /// payload byte is read.
    #[inline]
    pub fn would_overflow(&self, additional: u64) -> bool {
        self.message_len as u64 + additional > self.max_message_size as u64
    }

    /// Start assembling a message from its first frame
    pub fn begin(&mut self, kind: OpCode, compressed: bool) {
        debug_assert!(kind.is_data() && kind != OpCode::Continuation);
        self.kind = Some(kind);
        self.compressed = compressed;
        self.success = false;
        self.message_len = 0;
    }

    /// Mark the message complete (FIN frame fully received)
    #[inline]
    pub fn mark_success(&mut self) {
        self.success = true;
    }

    /// Append unmasked payload bytes
    ///
    /// Pass the connection's inflater for compressed messages; plain
    /// messages are copied into the chain directly.
    pub fn write(&mut self, data: &[u8], inflater: Option<&mut Inflater>) -> Result<()> {
        match inflater {
            Some(inflater) if self.compressed => self.write_inflate(data, inflater),
            _ => self.write_raw(data),
        }
    }

    fn write_raw(&mut self, mut data: &[u8]) -> Result<()> {
        if self.message_len + data.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        while !data.is_empty() {
            self.ensure_tail();
            let tail = match self.chain.tail_mut() {
                Some(tail) => tail,
                None => break,
            };
            let span = tail.available_mut();
            let n = span.len().min(data.len());
            span[..n].copy_from_slice(&data[..n]);
            tail.advance(n);
            self.message_len += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// Stream compressed bytes through the inflater into the chain
    ///
    /// The inflater accounts its own output: only inflated bytes count
    /// toward the logical message length and the size cap.
    fn write_inflate(&mut self, mut data: &[u8], inflater: &mut Inflater) -> Result<()> {
        loop {
            self.ensure_tail();
            let tail = match self.chain.tail_mut() {
                Some(tail) => tail,
                None => break,
            };
            let (consumed, written) = inflater.process(data, tail.available_mut())?;
            tail.advance(written);
            self.message_len += written;
            data = &data[consumed..];

            if self.message_len > self.max_message_size {
                return Err(Error::MessageTooLarge);
            }
            if written == 0 {
                if !data.is_empty() && consumed == 0 {
                    // Output space was available but the stream refused the
                    // input: the deflate data ended early.
                    return Err(Error::Protocol("trailing bytes after deflate stream end"));
                }
                if data.is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn ensure_tail(&mut self) {
        let needs_segment = self.chain.tail_mut().map_or(true, |t| t.remaining() == 0);
        if needs_segment {
            self.chain.append(pool::rent(0));
        }
    }

    /// Finalize the assembled message
    ///
    /// For compressed messages the 4-byte deflate tail is re-appended and
    /// inflated first. Yields the message opcode and its payload as one
    /// owned read-only byte sequence, then resets for the next message.
    pub fn finish(&mut self, inflater: Option<&mut Inflater>) -> Result<(OpCode, Bytes)> {
        if !self.success {
            return Err(Error::Protocol("message incomplete"));
        }
        let kind = self
            .kind
            .ok_or(Error::Protocol("no message being assembled"))?;

        if self.compressed {
            match inflater {
                Some(inflater) => self.write_inflate(&TRAILER, inflater)?,
                None => return Err(Error::Protocol("compressed message without inflater")),
            }
        }

        let mut payload = BytesMut::with_capacity(self.chain.written_len());
        for chunk in self.chain.iter_written() {
            payload.extend_from_slice(chunk);
        }

        self.reset();
        Ok((kind, payload.freeze()))
    }

    /// Drop any partially assembled message and release its segments
    pub fn reset(&mut self) {
        self.chain.clear();
        self.kind = None;
        self.compressed = false;
        self.success = false;
        self.message_len = 0;
    }
}
