//! Pooled buffer segments and segment chains
//!
//! Outgoing and incoming message payloads are accumulated into chains of
//! pooled byte blocks instead of one growing allocation. Blocks are rented
//! from a process-global pool and returned when the owning chain is dropped,
//! so release is exactly-once on every path, including early error returns.

use parking_lot::Mutex;

use crate::{MAX_HEADER_SIZE, SEGMENT_SIZE};

/// Maximum number of standard blocks the pool keeps cached
const MAX_CACHED_BLOCKS: usize = 256;

/// Process-global block pool
static POOL: Mutex<BlockPool> = Mutex::new(BlockPool::new());

struct BlockPool {
    free_list: Vec<Box<[u8]>>,
}

impl BlockPool {
    const fn new() -> Self {
        Self {
            free_list: Vec::new(),
        }
    }

    fn take(&mut self) -> Option<Box<[u8]>> {
        self.free_list.pop()
    }

    /// Accept a block back into the cache
    ///
    /// Only standard-size blocks are cached, and only up to the cap;
    /// everything else is dropped. A segment that was already released
    /// hands in an empty block, which is rejected here as well.
    fn put(&mut self, block: Box<[u8]>) {
        if block.len() == SEGMENT_SIZE && self.free_list.len() < MAX_CACHED_BLOCKS {
            self.free_list.push(block);
        }
    }
}

/// Rent a segment holding at least `min_size` bytes
///
/// Hint-sized rents are raised to `max(SEGMENT_SIZE, min_size + 14)` so a
/// frame header prefix always fits in front of a hinted payload. Returned
/// blocks may be larger than requested. Only standard-size blocks are
/// recycled through the pool; oversized rents are freed on release.
pub fn rent(min_size: usize) -> Segment {
    let size = SEGMENT_SIZE.max(min_size + MAX_HEADER_SIZE);

    let block = if size == SEGMENT_SIZE {
        POOL.lock().take()
    } else {
        None
    };

    let block = block.unwrap_or_else(|| vec![0u8; size].into_boxed_slice());

    Segment { block, position: 0 }
}

/// A rented byte block plus a write cursor
///
/// `written()` is everything in front of the cursor, `available_mut()` the
/// spare room behind it. The cursor never leaves `[0, capacity]`.
pub struct Segment {
    block: Box<[u8]>,
    position: usize,
}

impl Segment {
    /// Total block capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    /// Current write cursor
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes written so far
    #[inline]
    pub fn written(&self) -> &[u8] {
        &self.block[..self.position]
    }

    /// Mutable view of the written region (for in-place masking)
    #[inline]
    pub fn written_mut(&mut self) -> &mut [u8] {
        &mut self.block[..self.position]
    }

    /// Spare room behind the cursor
    #[inline]
    pub fn available_mut(&mut self) -> &mut [u8] {
        &mut self.block[self.position..]
    }

    /// Remaining capacity
    #[inline]
    pub fn remaining(&self) -> usize {
        self.block.len() - self.position
    }

    /// Advance the cursor over `n` freshly written bytes
    #[inline]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.position += n;
    }

    /// Pull the cursor back by `n` bytes
    #[inline]
    pub fn rewind(&mut self, n: usize) {
        debug_assert!(n <= self.position);
        self.position -= n;
    }

    /// Reset the cursor to the block start
    #[inline]
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Direct access to a range of the block (for header writes)
    #[inline]
    pub(crate) fn slice_mut(&mut self, start: usize, end: usize) -> &mut [u8] {
        &mut self.block[start..end]
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.block);
        POOL.lock().put(block);
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .finish()
    }
}

/// An ordered chain of segments forming one logical byte sequence
///
/// The chain is forward-linked with tail append; it has exactly one owner
/// and transfers whole into the finalized message. Dropping the chain
/// returns every block to the pool.
#[derive(Debug, Default)]
pub struct SegmentChain {
    segments: Vec<Segment>,
}

impl SegmentChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Append a segment, transferring its ownership to the chain
    #[inline]
    pub fn append(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Number of segments in the chain
    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the chain holds no segments
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total written bytes across all segments
    #[inline]
    pub fn written_len(&self) -> usize {
        self.segments.iter().map(|s| s.position()).sum()
    }

    /// Mutable first segment, if any
    #[inline]
    pub fn head_mut(&mut self) -> Option<&mut Segment> {
        self.segments.first_mut()
    }

    /// Mutable last segment, if any
    #[inline]
    pub fn tail_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut()
    }

    /// Detach the last segment
    #[inline]
    pub fn pop_tail(&mut self) -> Option<Segment> {
        self.segments.pop()
    }

    /// Iterate over the written region of each segment in order
    pub fn iter_written(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| s.written())
    }

    /// Mutable iteration over written regions (for in-place masking)
    pub(crate) fn iter_written_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.segments.iter_mut().map(|s| s.written_mut())
    }

    /// Copy the whole chain into one contiguous vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.written_len());
        for chunk in self.iter_written() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Release every segment back to the pool
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_rounds_up_to_segment_size() {
        let seg = rent(16);
        assert_eq!(seg.capacity(), SEGMENT_SIZE);

        let seg = rent(SEGMENT_SIZE);
        assert_eq!(seg.capacity(), SEGMENT_SIZE + MAX_HEADER_SIZE);
    }

    #[test]
    fn rent_honors_large_hints() {
        let seg = rent(100_000);
        assert_eq!(seg.capacity(), 100_000 + MAX_HEADER_SIZE);
    }

    #[test]
    fn cache_accepts_standard_blocks_only() {
        let mut pool = BlockPool::new();

        pool.put(vec![0u8; SEGMENT_SIZE].into_boxed_slice());
        assert_eq!(pool.free_list.len(), 1);

        // Oversized and already-released (empty) blocks are dropped.
        pool.put(vec![0u8; SEGMENT_SIZE * 2].into_boxed_slice());
        pool.put(Box::default());
        assert_eq!(pool.free_list.len(), 1);

        let block = pool.take().unwrap();
        assert_eq!(block.len(), SEGMENT_SIZE);
        assert!(pool.take().is_none());
    }

    #[test]
    fn cache_respects_cap() {
        let mut pool = BlockPool::new();
        for _ in 0..MAX_CACHED_BLOCKS + 10 {
            pool.put(vec![0u8; SEGMENT_SIZE].into_boxed_slice());
        }
        assert_eq!(pool.free_list.len(), MAX_CACHED_BLOCKS);
    }

    #[test]
    fn cursor_views() {
        let mut seg = rent(16);
        assert_eq!(seg.position(), 0);
        assert!(seg.written().is_empty());

        seg.available_mut()[..5].copy_from_slice(b"hello");
        seg.advance(5);
        assert_eq!(seg.written(), b"hello");
        assert_eq!(seg.remaining(), seg.capacity() - 5);

        seg.rewind(2);
        assert_eq!(seg.written(), b"hel");
    }

    #[test]
    fn chain_appends_in_order() {
        let mut chain = SegmentChain::new();
        for word in [&b"one"[..], b"two", b"three"] {
            let mut seg = rent(word.len());
            seg.available_mut()[..word.len()].copy_from_slice(word);
            seg.advance(word.len());
            chain.append(seg);
        }

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.written_len(), 11);
        assert_eq!(chain.to_vec(), b"onetwothree");
    }
}
