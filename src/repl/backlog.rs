//! The replication backlog.
//!
//! A fixed-capacity byte ring holding the framed command stream most
//! recently produced by the executor. Positions are logical offsets that
//! only ever grow; the physical ring position is derived, never exposed.
//! When the ring cannot fit the next command it deliberately discards its
//! oldest half and the affected slaves fall back to full resync. That is
//! policy, not failure.

use tracing::debug;

/// Bounded command-stream ring for incremental resync.
pub struct ReplBacklog {
    buf: Box<[u8]>,
    /// Physical index of the logical start
    head: usize,
    /// Bytes currently retained
    len: usize,
    /// Logical offset of the first retained byte; non-decreasing
    start_offset: u64,
}

impl ReplBacklog {
    /// Create a backlog with `capacity` bytes of storage.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            start_offset: 0,
        }
    }

    /// Storage capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Logical offset of the oldest retained byte. Bytes before this are
    /// permanently unavailable.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Logical offset one past the newest retained byte; this is the
    /// master's replication offset.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.len as u64
    }

    /// Bytes currently retained.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one framed command to the stream.
    ///
    /// When free space is insufficient the oldest half of the capacity is
    /// discarded first. A frame larger than the whole ring cannot be
    /// retained at all: the ring empties and the offsets advance past the
    /// frame, so the next sync decision degrades to a full resync instead
    /// of ever serving a torn stream.
    pub fn append(&mut self, frame: &[u8]) {
        if frame.len() > self.capacity() {
            debug!(
                frame = frame.len(),
                capacity = self.capacity(),
                "frame exceeds backlog capacity, forcing full resync"
            );
            self.start_offset = self.end_offset() + frame.len() as u64;
            self.head = 0;
            self.len = 0;
            return;
        }
        while self.capacity() - self.len < frame.len() {
            self.discard_oldest_half();
        }
        let cap = self.capacity();
        let mut pos = (self.head + self.len) % cap;
        for &b in frame {
            self.buf[pos] = b;
            pos = (pos + 1) % cap;
        }
        self.len += frame.len();
    }

    /// Drop the oldest `capacity / 2` bytes (or everything, if less is
    /// retained), advancing the logical start.
    fn discard_oldest_half(&mut self) {
        let drop = (self.capacity() / 2).max(1).min(self.len);
        self.head = (self.head + drop) % self.capacity();
        self.len -= drop;
        self.start_offset += drop as u64;
        debug!(
            dropped = drop,
            start_offset = self.start_offset,
            "backlog discarded oldest bytes"
        );
    }

    /// True when the stream from `offset` to the end is fully retained.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start_offset && offset <= self.end_offset()
    }

    /// Copy out the bytes covering `[offset, end_offset)`.
    ///
    /// Returns `None` when `offset` falls before the retained range; the
    /// caller must fall back to full resync, never read out of range.
    pub fn slice_from(&self, offset: u64) -> Option<Vec<u8>> {
        if !self.contains(offset) {
            return None;
        }
        let skip = (offset - self.start_offset) as usize;
        let cap = self.capacity();
        let mut out = Vec::with_capacity(self.len - skip);
        let mut pos = (self.head + skip) % cap;
        for _ in skip..self.len {
            out.push(self.buf[pos]);
            pos = (pos + 1) % cap;
        }
        Some(out)
    }
}
