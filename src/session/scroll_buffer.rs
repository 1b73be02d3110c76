//! Output ring buffer
//!
//! Holds the most recent raw output of a shell so that a newly attached
//! observer sees what is on screen. Bytes are stored as received (escape
//! sequences included); the oldest bytes are dropped once capacity is hit.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default capacity in bytes
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Buffer statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    /// Bytes currently held
    pub current_bytes: usize,
    /// Bytes ever written (including dropped)
    pub total_bytes: u64,
    pub capacity: usize,
}

/// Bounded byte ring
///
/// Not synchronized; the owning session guards it together with its
/// observer list so replay and broadcast never interleave.
#[derive(Debug)]
pub struct ScrollBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    total_bytes: u64,
}

impl ScrollBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_bytes: 0,
        }
    }

    /// Append output, dropping the oldest bytes past capacity.
    ///
    /// After a trim the front never starts in the middle of a UTF-8
    /// sequence.
    pub fn append(&mut self, data: &[u8]) {
        self.total_bytes += data.len() as u64;
        if self.capacity == 0 {
            return;
        }

        if data.len() >= self.capacity {
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - self.capacity..]);
        } else {
            self.bytes.extend(data);
            let overflow = self.bytes.len().saturating_sub(self.capacity);
            if overflow == 0 {
                return;
            }
            self.bytes.drain(..overflow);
        }

        while matches!(self.bytes.front(), Some(b) if is_continuation(*b)) {
            self.bytes.pop_front();
        }
    }

    /// Copy of the current contents, oldest first
    pub fn contents(&self) -> Vec<u8> {
        let (a, b) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            current_bytes: self.bytes.len(),
            total_bytes: self.total_bytes,
            capacity: self.capacity,
        }
    }
}

impl Default for ScrollBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}
