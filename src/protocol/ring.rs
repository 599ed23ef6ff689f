//! Byte accumulator for incoming stream chunks.
//!
//! Incoming socket reads land here as refcounted `Bytes` chunks without
//! copying. The packetizer peeks at prefixes to decide whether a complete
//! frame has arrived, then consumes exactly what it used.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// FIFO accumulator of byte chunks with prefix peek/consume.
///
/// `peek` only coalesces when the first chunk alone cannot satisfy the
/// request; the coalesced buffer replaces the chunks it absorbed, so
/// repeated peeks at the same prefix do not copy again.
#[derive(Debug, Default)]
pub struct ByteRing {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    /// Append a chunk to the back of the ring. O(1), no copy.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the first `n` bytes without consuming them.
    ///
    /// Returns `None` if fewer than `n` bytes are buffered. If the first
    /// chunk already holds `n` bytes this is a zero-copy slice; otherwise
    /// leading chunks are merged into one and re-fronted before slicing.
    pub fn peek(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        if self.chunks[0].len() < n {
            self.coalesce_front(n);
        }
        Some(self.chunks[0].slice(..n))
    }

    /// Remove the first `n` bytes from the ring.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are buffered. Callers must only
    /// consume what a prior `peek` confirmed present.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "ring underflow: consume {} of {}", n, self.len);

        let mut remaining = n;
        while remaining > 0 {
            let front_len = self.chunks[0].len();
            if front_len <= remaining {
                self.chunks.pop_front();
                remaining -= front_len;
            } else {
                let front = &mut self.chunks[0];
                *front = front.slice(remaining..);
                remaining = 0;
            }
        }
        self.len -= n;
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Merge leading chunks until the front holds at least `n` bytes.
    fn coalesce_front(&mut self, n: usize) {
        let mut merged = BytesMut::with_capacity(n);
        while merged.len() < n {
            let chunk = self
                .chunks
                .pop_front()
                .expect("peek checked total length");
            merged.extend_from_slice(&chunk);
        }
        self.chunks.push_front(merged.freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_len() {
        let mut ring = ByteRing::new();
        assert!(ring.is_empty());

        ring.append(Bytes::from_static(b"abc"));
        ring.append(Bytes::from_static(b"de"));

        assert_eq!(ring.len(), 5);
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::new());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_peek_within_first_chunk() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"hello world"));

        assert_eq!(ring.peek(5).unwrap(), Bytes::from_static(b"hello"));
        // Not consumed
        assert_eq!(ring.len(), 11);
    }

    #[test]
    fn test_peek_across_chunks_coalesces() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"he"));
        ring.append(Bytes::from_static(b"ll"));
        ring.append(Bytes::from_static(b"o!"));

        assert_eq!(ring.peek(5).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(ring.len(), 6);

        // Second peek at the same prefix hits the coalesced front chunk
        assert_eq!(ring.peek(5).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_peek_insufficient_returns_none() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"ab"));
        assert!(ring.peek(3).is_none());
        // Ring untouched
        assert_eq!(ring.peek(2).unwrap(), Bytes::from_static(b"ab"));
    }

    #[test]
    fn test_consume_partial_chunk() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"abcdef"));

        ring.consume(2);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.peek(4).unwrap(), Bytes::from_static(b"cdef"));
    }

    #[test]
    fn test_consume_across_chunks() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"ab"));
        ring.append(Bytes::from_static(b"cd"));
        ring.append(Bytes::from_static(b"ef"));

        ring.consume(3);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.peek(3).unwrap(), Bytes::from_static(b"def"));
    }

    #[test]
    #[should_panic(expected = "ring underflow")]
    fn test_consume_underflow_panics() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"ab"));
        ring.consume(3);
    }

    #[test]
    fn test_clear() {
        let mut ring = ByteRing::new();
        ring.append(Bytes::from_static(b"data"));
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.peek(1).is_none());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut ring = ByteRing::new();
        for b in b"stream" {
            ring.append(Bytes::copy_from_slice(&[*b]));
        }
        assert_eq!(ring.peek(6).unwrap(), Bytes::from_static(b"stream"));
        ring.consume(6);
        assert!(ring.is_empty());
    }
}
