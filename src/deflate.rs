//! Streaming deflate/inflate for permessage-deflate (RFC 7692)
//!
//! Thin adapters over `flate2`'s raw-deflate streams. One deflater and one
//! inflater live for the whole connection (context-takeover mode): the LZ77
//! history carries across messages and is never reset.
//!
//! Per RFC 7692 each compressed message ends with `00 00 FF FF` on the
//! deflate side. [`Deflater::finish`] emits that trailer via a sync flush
//! and the send buffer strips the final 4 bytes; symmetrically the receive
//! buffer feeds [`TRAILER`] through [`Inflater::process`] before finishing
//! a compressed message.

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Trailer removed after compression and re-appended before decompression
pub const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Compression level used for outgoing messages
const LEVEL: u32 = 6;

fn compression_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("deflate stream: {}", e))
}

/// Streaming compressor for outgoing message payloads
pub struct Deflater {
    compress: Compress,
}

impl Deflater {
    /// Create a raw-deflate compressor (no zlib header)
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::new(LEVEL), false),
        }
    }

    /// Compress as much of `input` into `output` as fits
    ///
    /// No-flush semantics: the stream may buffer input internally without
    /// producing output yet. Returns `(consumed, written)`. `Ok`,
    /// `StreamEnd` and `BufError` all return normally so the caller can
    /// supply more output space; real stream errors are I/O-class.
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<(usize, usize)> {
        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();

        let status = self
            .compress
            .compress(input, output, FlushCompress::None)
            .map_err(compression_error)?;

        match status {
            Status::Ok | Status::StreamEnd | Status::BufError => {}
        }

        let consumed = (self.compress.total_in() - before_in) as usize;
        let written = (self.compress.total_out() - before_out) as usize;
        Ok((consumed, written))
    }

    /// Flush the message tail into `output` with a sync flush
    ///
    /// Returns `(written, complete)`; `complete` is false while the flush
    /// still has pending bytes and the caller must call again with fresh
    /// output space. The sync flush ends the message with the `00 00 FF FF`
    /// trailer, which the caller strips before sending.
    pub fn finish(&mut self, output: &mut [u8]) -> io::Result<(usize, bool)> {
        let before_out = self.compress.total_out();

        debug_assert!(!output.is_empty());

        self.compress
            .compress(&[], output, FlushCompress::Sync)
            .map_err(compression_error)?;

        let written = (self.compress.total_out() - before_out) as usize;

        // The flush is done once it leaves spare room in the buffer: with
        // space available, any pending bytes would have been written.
        let complete = written < output.len();

        Ok((written, complete))
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming decompressor for incoming message payloads
pub struct Inflater {
    decompress: Decompress,
}

impl Inflater {
    /// Create a raw-deflate decompressor (no zlib header)
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
        }
    }

    /// Inflate as much of `input` into `output` as fits
    ///
    /// Returns `(consumed, written)`. `BufError` means the output is full
    /// and the caller should grow it and call again.
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> io::Result<(usize, usize)> {
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();

        let status = self
            .decompress
            .decompress(input, output, FlushDecompress::None)
            .map_err(compression_error)?;

        match status {
            Status::Ok | Status::StreamEnd | Status::BufError => {}
        }

        let consumed = (self.decompress.total_in() - before_in) as usize;
        let written = (self.decompress.total_out() - before_out) as usize;
        Ok((consumed, written))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
