//! Byte-bounded replay ring.
//!
//! [`ReplayRing`] keeps the most recent output of a session so a reattaching
//! client can redraw its screen. Capacity is measured in bytes, not chunks:
//! once full, the oldest chunks are evicted, and a single chunk larger than
//! the whole capacity is trimmed to its tail.

use std::collections::VecDeque;
use std::sync::Arc;

/// One sequenced output chunk. Cloning shares the bytes.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonically increasing, unique within a session, starting at 1.
    pub seq: u64,
    pub data: Arc<[u8]>,
}

/// Ring of [`Chunk`]s holding at most `capacity` bytes.
#[derive(Debug)]
pub struct ReplayRing {
    chunks: VecDeque<Chunk>,
    bytes: usize,
    capacity: usize,
    next_seq: u64,
}

impl ReplayRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
            next_seq: 1,
        }
    }

    /// Append output, evicting the oldest chunks until it fits.
    /// Returns the stored chunk for fan-out.
    pub fn push(&mut self, data: &[u8]) -> Chunk {
        let kept = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        while self.bytes + kept.len() > self.capacity {
            match self.chunks.pop_front() {
                Some(old) => self.bytes -= old.data.len(),
                None => break,
            }
        }

        let chunk = Chunk {
            seq: self.next_seq,
            data: Arc::from(data),
        };
        self.next_seq += 1;
        if !kept.is_empty() {
            self.bytes += kept.len();
            self.chunks.push_back(Chunk {
                seq: chunk.seq,
                data: if kept.len() == data.len() {
                    Arc::clone(&chunk.data)
                } else {
                    Arc::from(kept)
                },
            });
        }
        chunk
    }

    /// Everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<Chunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Bytes currently buffered (never above capacity).
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next pushed chunk will get.
    #[cfg(test)]
    fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Sequence number of the oldest buffered chunk, if any.
    #[cfg(test)]
    fn oldest_seq(&self) -> Option<u64> {
        self.chunks.front().map(|c| c.seq)
    }
}
