//! Stream decoding on top of [`crate::parse`].

use crate::error::SrrpError;
use crate::packet::{parse, Packet, MAGIC};
use bytes::{Buf, Bytes, BytesMut};

/// Bytes of a dropped region included in the warning log.
const DUMP_LIMIT: usize = 64;

/// Returns the offset of the next frame marker in `buf`.
///
/// A marker cut off by the end of `buf` counts, so that a frame split across
/// two reads is not thrown away. Returns `None` when no marker can start
/// anywhere in `buf`.
pub fn next_frame_offset(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| {
        let rest = &buf[i..];
        let n = rest.len().min(MAGIC.len());
        rest[..n] == MAGIC[..n]
    })
}

/// Incremental decoder for a continuous SRRP byte stream.
///
/// Unlike [`parse`], the decoder owns its buffer and repairs it: garbage in
/// front of a frame and malformed frames are dropped, and fragments are
/// joined so that [`Decoder::decode`] only yields complete packets.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    pending: Option<Packet>,
    dropped: u64,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            pending: None,
            dropped: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the total number of bytes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Returns whether fragments of an unfinished packet are held back.
    pub fn has_pending_fragment(&self) -> bool {
        self.pending.is_some()
    }

    /// Removes and returns the undecoded bytes, e.g. an unfinished frame
    /// left when the stream ends. Held-back fragments are discarded.
    pub fn take_buffered(&mut self) -> Bytes {
        self.pending = None;
        self.buffer.split().freeze()
    }

    /// Clears buffered bytes and any unfinished packet.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }

    /// Decodes the next frame without joining fragments.
    ///
    /// On a malformed frame the offending bytes are discarded before the
    /// error is returned, so calling again continues with the rest of the
    /// stream.
    pub fn decode_frame(&mut self) -> Result<Option<Packet>, SrrpError> {
        self.skip_garbage();

        match parse(&self.buffer) {
            Ok(Some((packet, consumed))) => {
                self.buffer.advance(consumed);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                let len = e.frame_len().unwrap_or_else(|| self.resync_len());
                self.discard(len);
                Err(e)
            }
        }
    }

    /// Decodes the next complete packet, reassembling fragments.
    pub fn decode(&mut self) -> Result<Option<Packet>, SrrpError> {
        loop {
            let Some(frame) = self.decode_frame()? else {
                return Ok(None);
            };

            let packet = match self.pending.take() {
                Some(pending) => match pending.concat(&frame) {
                    Ok(joined) => joined,
                    Err(e) => {
                        tracing::warn!(
                            "dropping unfinished {} packet on {:?}: {}",
                            pending.category(),
                            pending.anchor(),
                            e
                        );
                        frame
                    }
                },
                None => frame,
            };

            if packet.is_final() {
                return Ok(Some(packet));
            }
            self.pending = Some(packet);
        }
    }

    /// Abandons the frame at the head of the buffer and skips to the next
    /// marker. Returns the number of bytes dropped.
    ///
    /// Used when a partial frame stops making progress.
    pub fn skip_to_next_frame(&mut self) -> usize {
        let len = self.resync_len();
        self.discard(len);
        len
    }

    fn skip_garbage(&mut self) {
        match next_frame_offset(&self.buffer) {
            Some(0) => {}
            Some(offset) => self.discard(offset),
            None => self.discard(self.buffer.len()),
        }
    }

    fn resync_len(&self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        next_frame_offset(&self.buffer[1..])
            .map(|offset| offset + 1)
            .unwrap_or(self.buffer.len())
    }

    fn discard(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        let len = len.min(self.buffer.len());
        tracing::warn!(
            "broken stream, dropping {} bytes: {}",
            len,
            hex::encode(&self.buffer[..len.min(DUMP_LIMIT)])
        );
        self.buffer.advance(len);
        self.dropped += len as u64;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Category;

    #[test]
    fn test_next_frame_offset() {
        assert_eq!(next_frame_offset(b"SRRP...."), Some(0));
        assert_eq!(next_frame_offset(b"xxSRRP"), Some(2));
        assert_eq!(next_frame_offset(b"xxxSR"), Some(3));
        assert_eq!(next_frame_offset(b"xyz"), None);
        assert_eq!(next_frame_offset(b""), None);
    }

    #[test]
    fn test_decode_back_to_back() {
        let a = Packet::request(1, "/a", &b"one"[..]).unwrap();
        let b = Packet::response(2, "/b", &b"two"[..]).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(a.raw());
        decoder.extend(b.raw());

        assert_eq!(decoder.decode().unwrap().unwrap(), a);
        assert_eq!(decoder.decode().unwrap().unwrap(), b);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let packet = Packet::publish(5, "/motor/speed", &b"j:{speed:12}"[..]).unwrap();
        let mut decoder = Decoder::new();

        let raw = packet.raw();
        for (i, byte) in raw.iter().enumerate() {
            decoder.extend(&[*byte]);
            let decoded = decoder.decode().unwrap();
            if i + 1 < raw.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded.unwrap(), packet);
            }
        }
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn test_garbage_before_frame_is_dropped() {
        let packet = Packet::ctrl(0x1111, "/sync", "").unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(b"hello world");
        decoder.extend(packet.raw());

        assert_eq!(decoder.decode().unwrap().unwrap(), packet);
        assert_eq!(decoder.dropped(), 11);
    }

    #[test]
    fn test_corrupt_frame_then_recovery() {
        let bad = Packet::request(1, "/x", &b"corrupt me"[..]).unwrap();
        let good = Packet::request(2, "/y", &b"fine"[..]).unwrap();

        let mut raw = bad.raw().to_vec();
        let len = raw.len();
        raw[len - 5] ^= 0x55;

        let mut decoder = Decoder::new();
        decoder.extend(&raw);
        decoder.extend(good.raw());

        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, SrrpError::CrcMismatch { .. }));
        assert_eq!(decoder.dropped(), len as u64);
        assert_eq!(decoder.decode().unwrap().unwrap(), good);
    }

    #[test]
    fn test_bad_header_resyncs_to_next_marker() {
        let good = Packet::ctrl(3, "/sync", "").unwrap();
        let mut raw = Packet::ctrl(1, "/sync", "").unwrap().raw().to_vec();
        raw[4] = 42; // unsupported version

        let mut decoder = Decoder::new();
        decoder.extend(&raw);
        decoder.extend(good.raw());

        assert!(matches!(
            decoder.decode(),
            Err(SrrpError::UnsupportedVersion(42))
        ));
        assert_eq!(decoder.decode().unwrap().unwrap(), good);
    }

    #[test]
    fn test_fragments_are_reassembled() {
        let payload = vec![b'z'; 3000];
        let packet = Packet::publish(4, "/bulk", payload).unwrap();

        let mut decoder = Decoder::new();
        for fragment in packet.split(1400).unwrap() {
            decoder.extend(fragment.raw());
        }

        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(!decoder.has_pending_fragment());
    }

    #[test]
    fn test_interrupted_fragment_is_dropped() {
        let packet = Packet::publish(4, "/bulk", vec![b'a'; 20]).unwrap();
        let fragments = packet.split(10).unwrap();
        let other = Packet::request(9, "/other", &b"hi"[..]).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(fragments[0].raw());
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.has_pending_fragment());

        decoder.extend(other.raw());
        assert_eq!(decoder.decode().unwrap().unwrap(), other);
        assert!(!decoder.has_pending_fragment());
        assert_eq!(other.category(), Category::Request);
    }

    #[test]
    fn test_skip_stalled_frame() {
        let packet = Packet::request(1, "/x", &b"abc"[..]).unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&packet.raw()[..10]);
        assert!(decoder.decode().unwrap().is_none());

        assert_eq!(decoder.skip_to_next_frame(), 10);
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(packet.raw());
        assert_eq!(decoder.decode().unwrap().unwrap(), packet);
    }

    #[test]
    fn test_clear() {
        let mut decoder = Decoder::default();
        decoder.extend(b"SRRP");
        assert_eq!(decoder.buffered(), 4);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_take_buffered_returns_partial_frame() {
        let packet = Packet::publish(1, "/t", &b"tail"[..]).unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&packet.raw()[..9]);
        assert!(decoder.decode().unwrap().is_none());

        assert_eq!(&decoder.take_buffered()[..], &packet.raw()[..9]);
        assert_eq!(decoder.buffered(), 0);
    }
}
