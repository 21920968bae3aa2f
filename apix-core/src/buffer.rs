//! Byte queues backing descriptor read buffers and write queues.

use crate::error::ApixError;
use bytes::{Buf, Bytes, BytesMut};

/// FIFO byte queue: append at the tail, consume from the head.
///
/// An optional limit caps the number of queued bytes. Appends that would
/// exceed it fail as a whole and leave the queue untouched.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buf: BytesMut,
    limit: Option<usize>,
}

impl ByteQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn bounded(limit: usize) -> Self {
        Self::new(Some(limit))
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes that can still be appended before hitting the limit.
    pub fn remaining(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.buf.len()),
            None => usize::MAX,
        }
    }

    /// Appends `bytes` to the tail.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), ApixError> {
        if let Some(max) = self.limit {
            let len = self.buf.len() + bytes.len();
            if len > max {
                return Err(ApixError::BufferOverflow { len, max });
            }
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Removes and returns up to `max_len` bytes from the head.
    pub fn consume(&mut self, max_len: usize) -> Bytes {
        let n = max_len.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Copies up to `out.len()` bytes from the head into `out` and removes them.
    pub fn consume_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Removes and returns everything queued.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Queued bytes, head first, without removing them.
    pub fn chunk(&self) -> &[u8] {
        &self.buf
    }

    /// Drops `n` bytes from the head.
    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = ByteQueue::unbounded();
        queue.append(b"AB").unwrap();
        queue.append(b"CD").unwrap();
        assert_eq!(queue.len(), 4);
        assert_eq!(&queue.consume(4)[..], b"ABCD");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_consume_keeps_rest() {
        let mut queue = ByteQueue::unbounded();
        queue.append(b"hello world").unwrap();

        let mut out = [0u8; 5];
        assert_eq!(queue.consume_into(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(queue.chunk(), b" world");

        assert_eq!(&queue.consume(100)[..], b" world");
        assert_eq!(queue.consume(10).len(), 0);
        assert_eq!(queue.consume_into(&mut out), 0);
    }

    #[test]
    fn test_bounded_append_is_all_or_nothing() {
        let mut queue = ByteQueue::bounded(4);
        queue.append(b"abc").unwrap();
        assert_eq!(queue.remaining(), 1);

        let err = queue.append(b"de").unwrap_err();
        assert!(matches!(err, ApixError::BufferOverflow { len: 5, max: 4 }));
        assert_eq!(queue.chunk(), b"abc");

        queue.append(b"d").unwrap();
        assert_eq!(queue.remaining(), 0);
    }

    #[test]
    fn test_advance_and_take_all() {
        let mut queue = ByteQueue::unbounded();
        queue.append(b"0123456789").unwrap();
        queue.advance(3);
        assert_eq!(queue.chunk(), b"3456789");
        queue.advance(100);
        assert!(queue.is_empty());

        queue.append(b"xyz").unwrap();
        assert_eq!(&queue.take_all()[..], b"xyz");
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.remaining(), usize::MAX);
    }
}
