//! Send buffer: message accumulation, compression and in-place framing
//!
//! A [`SendBuffer`] accumulates one outgoing message into a chain of pooled
//! segments. The first segment of the chain reserves
//! [`MAX_HEADER_SIZE`](crate::MAX_HEADER_SIZE) bytes in front of the payload;
//! [`SendBuffer::finish`] writes the frame header backwards into that prefix
//! and XOR-masks the payload in place on the client side, so the finished
//! message is sent without copying payload bytes.
//!
//! With compression enabled, user bytes are staged in a scratch segment and
//! pushed through the connection's deflate stream into the chain; the
//! RFC 7692 `00 00 FF FF` trailer emitted by the final sync flush is
//! stripped before framing, rewinding across a segment boundary when the
//! tail holds fewer than 4 of the trailer bytes.

use std::io;

use crate::deflate::Deflater;
use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask_offset;
use crate::pool::{self, Segment, SegmentChain};
use crate::{MAX_HEADER_SIZE, SEGMENT_SIZE};

/// How a finished message is laid out for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Byte-stream transport: reserve a header prefix, frame and mask
    Frame,
    /// Already-framed pipe: raw payload, no header, no mask
    Passthrough,
}

impl Framing {
    #[inline]
    fn reserved(self) -> usize {
        match self {
            Framing::Frame => MAX_HEADER_SIZE,
            Framing::Passthrough => 0,
        }
    }
}

/// A finalized outgoing message owning its segment chain
///
/// `offset` is the byte index in the first segment where the wire bytes
/// begin: headers shorter than the 14-byte reserved prefix are written
/// right-aligned, so the transport emits `written - offset` bytes.
#[derive(Debug)]
pub struct WireMessage {
    pub(crate) opcode: OpCode,
    pub(crate) chain: SegmentChain,
    pub(crate) offset: usize,
}

impl WireMessage {
    /// Opcode of the frame
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Total bytes this message puts on the wire
    pub fn wire_len(&self) -> usize {
        self.chain.written_len() - self.offset
    }

    /// Wire byte chunks in transmit order
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let offset = self.offset;
        self.chain
            .iter_written()
            .enumerate()
            .map(move |(i, chunk)| if i == 0 { &chunk[offset..] } else { chunk })
            .filter(|chunk| !chunk.is_empty())
    }

    /// Copy the wire bytes into one contiguous vector (tests, diagnostics)
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Accumulates one outgoing message into a pooled segment chain
///
/// Reused across messages on a connection: `finish` hands the chain to the
/// produced [`WireMessage`] and resets the buffer for the next message.
pub struct SendBuffer {
    /// Completed output segments (compressed or raw payload)
    chain: SegmentChain,
    /// Active segment accumulating raw user bytes
    current: Option<Segment>,
    framing: Framing,
    /// Whether any user bytes entered the current message
    wrote_any: bool,
}

impl SendBuffer {
    /// Create a send buffer for the given transport framing
    pub fn new(framing: Framing) -> Self {
        Self {
            chain: SegmentChain::new(),
            current: None,
            framing,
            wrote_any: false,
        }
    }

    /// Discard any partially accumulated message
    ///
    /// Dropping the chain returns every rented segment to the pool.
    pub fn reset(&mut self) {
        self.chain.clear();
        self.current = None;
        self.wrote_any = false;
    }

    /// Get a writable span of at least `hint` bytes
    ///
    /// Pass the connection's deflater when compression is negotiated; it is
    /// invoked when the current segment must be drained to make room. The
    /// returned span may be larger than the hint; advance only what was
    /// written.
    pub fn writable(
        &mut self,
        hint: usize,
        mut deflater: Option<&mut Deflater>,
    ) -> io::Result<&mut [u8]> {
        let hint = hint.clamp(1, SEGMENT_SIZE - MAX_HEADER_SIZE);

        if self
            .current
            .as_ref()
            .is_some_and(|cur| cur.remaining() < hint)
        {
            self.roll(deflater.as_deref_mut())?;
        }

        if self.current.is_none() {
            let mut seg = pool::rent(hint);
            if deflater.is_none() && self.chain.is_empty() {
                // Uncompressed first segment carries the header prefix;
                // with compression the prefix lives in the first
                // deflate-output segment instead.
                seg.advance(self.framing.reserved());
            }
            self.current = Some(seg);
        }

        Ok(self
            .current
            .as_mut()
            .map(Segment::available_mut)
            .unwrap_or(&mut []))
    }

    /// Commit `n` bytes written into the last span
    #[inline]
    pub fn advance(&mut self, n: usize) {
        if let Some(cur) = self.current.as_mut() {
            cur.advance(n);
            if n > 0 {
                self.wrote_any = true;
            }
        }
    }

    /// Append a byte slice, spanning segments as needed
    pub fn write(
        &mut self,
        mut data: &[u8],
        mut deflater: Option<&mut Deflater>,
    ) -> io::Result<()> {
        while !data.is_empty() {
            let span = self.writable(data.len(), deflater.as_deref_mut())?;
            let n = span.len().min(data.len());
            span[..n].copy_from_slice(&data[..n]);
            self.advance(n);
            data = &data[n..];
        }
        Ok(())
    }

    /// Append UTF-8 text
    pub fn write_str(&mut self, text: &str, deflater: Option<&mut Deflater>) -> io::Result<()> {
        self.write(text.as_bytes(), deflater)
    }

    /// Drain the current segment: compress it into the chain, or hand it
    /// over whole when compression is off.
    fn roll(&mut self, deflater: Option<&mut Deflater>) -> io::Result<()> {
        let Some(mut cur) = self.current.take() else {
            return Ok(());
        };
        if cur.position() == 0 {
            self.current = Some(cur);
            return Ok(());
        }

        match deflater {
            Some(deflater) => {
                self.deflate_into_chain(cur.written(), deflater)?;
                cur.reset();
                self.current = Some(cur);
            }
            None => self.chain.append(cur),
        }
        Ok(())
    }

    /// Run `input` through the deflater, appending output segments as the
    /// tail fills up.
    fn deflate_into_chain(&mut self, mut input: &[u8], deflater: &mut Deflater) -> io::Result<()> {
        while !input.is_empty() {
            self.ensure_output_tail();
            let tail = match self.chain.tail_mut() {
                Some(tail) => tail,
                None => break,
            };
            let (consumed, written) = deflater.process(input, tail.available_mut())?;
            tail.advance(written);
            input = &input[consumed..];

            if consumed == 0 && written == 0 {
                // Output space was available, so a stalled stream cannot
                // make progress on another pass either.
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                ));
            }
        }
        Ok(())
    }

    /// Make sure the chain ends with a segment that has spare room
    fn ensure_output_tail(&mut self) {
        let needs_segment = self.chain.tail_mut().map_or(true, |t| t.remaining() == 0);
        if needs_segment {
            let mut seg = pool::rent(0);
            if self.chain.is_empty() {
                seg.advance(self.framing.reserved());
            }
            self.chain.append(seg);
        }
    }

    /// Strip the 4-byte sync-flush trailer off the end of the chain
    ///
    /// The deflater always emits the full trailer after `finish`, but the
    /// tail segment may hold fewer than 4 of its bytes; in that case the
    /// tail is dropped and the rewind continues in the previous segment.
    fn strip_trailer(&mut self) {
        let reserved = self.framing.reserved();
        let mut strip = 4usize;

        while strip > 0 {
            let is_first = self.chain.len() == 1;
            let floor = if is_first { reserved } else { 0 };
            let Some(tail) = self.chain.tail_mut() else {
                break;
            };

            let avail = tail.position() - floor;
            if avail > strip {
                tail.rewind(strip);
                break;
            }

            strip -= avail;
            if is_first {
                // The sync flush guarantees at least 4 trailing bytes, so
                // the strip never reaches into the header prefix.
                debug_assert_eq!(strip, 0);
                tail.rewind(avail);
                break;
            }
            self.chain.pop_tail();
        }
    }

    /// Finalize the accumulated message
    ///
    /// Flushes pending bytes (through the deflater when compressing),
    /// strips the compression trailer, writes the frame header into the
    /// reserved prefix and masks the payload when `mask` is given.
    /// The buffer is left empty, ready for the next message.
    pub fn finish(
        &mut self,
        opcode: OpCode,
        deflater: Option<&mut Deflater>,
        mask: Option<[u8; 4]>,
    ) -> io::Result<WireMessage> {
        let compressed = deflater.is_some() && self.wrote_any;

        match deflater {
            Some(deflater) if self.wrote_any => {
                if let Some(cur) = self.current.take() {
                    if cur.position() > 0 {
                        self.deflate_into_chain(cur.written(), deflater)?;
                    }
                }
                loop {
                    self.ensure_output_tail();
                    let tail = match self.chain.tail_mut() {
                        Some(tail) => tail,
                        None => break,
                    };
                    let (written, complete) = deflater.finish(tail.available_mut())?;
                    tail.advance(written);
                    if complete {
                        break;
                    }
                }
                self.strip_trailer();
            }
            _ => {
                if let Some(cur) = self.current.take() {
                    // A prefix-only segment (position 14, empty message)
                    // still carries the header and is kept.
                    if cur.position() > 0 {
                        self.chain.append(cur);
                    }
                }
            }
        }

        // An empty message still needs a segment to carry the header.
        if self.chain.is_empty() {
            let mut seg = pool::rent(0);
            seg.advance(self.framing.reserved());
            self.chain.append(seg);
        }

        let reserved = self.framing.reserved();
        let payload_len = (self.chain.written_len() - reserved) as u64;

        let offset = match self.framing {
            Framing::Frame => {
                let header = FrameHeader {
                    fin: true,
                    compressed,
                    opcode,
                    masked: mask.is_some(),
                    payload_len,
                    mask,
                };

                let mut scratch = [0u8; MAX_HEADER_SIZE];
                let header_len = header.encode(&mut scratch);
                let offset = MAX_HEADER_SIZE - header_len;

                if let Some(head) = self.chain.head_mut() {
                    head.slice_mut(offset, MAX_HEADER_SIZE)
                        .copy_from_slice(&scratch[..header_len]);
                }

                if let Some(mask) = mask {
                    let mut payload_offset = 0usize;
                    for (i, chunk) in self.chain.iter_written_mut().enumerate() {
                        let chunk = if i == 0 { &mut chunk[reserved..] } else { chunk };
                        apply_mask_offset(chunk, mask, payload_offset);
                        payload_offset += chunk.len();
                    }
                }

                offset
            }
            Framing::Passthrough => 0,
        };

        let chain = std::mem::take(&mut self.chain);
        self.wrote_any = false;

        Ok(WireMessage {
            opcode,
            chain,
            offset,
        })
    }
}
