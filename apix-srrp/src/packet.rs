//! SRRP packet model and frame format.
//!
//! Frame layout (15 bytes header + anchor + payload + 4 bytes trailer):
//!
//! ```text
//! +--------+---------+----------+--------+--------+------------+-------------+
//! | magic  | version | category | flags  | leader | anchor_len | payload_len |
//! | 4 bytes| 1 byte  | 1 byte   | 1 byte | 2 bytes|  2 bytes   |   4 bytes   |
//! +--------+---------+----------+--------+--------+------------+-------------+
//! | anchor            | payload                    | crc32c                  |
//! | anchor_len bytes  | payload_len bytes          | 4 bytes                 |
//! +-------------------+----------------------------+-------------------------+
//! ```
//!
//! All integers are big-endian. The CRC32C covers every byte before it, so a
//! frame is only accepted once it is complete and intact.

use crate::error::SrrpError;
use crate::{MAX_ANCHOR_LEN, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame-start marker: "SRRP"
pub const MAGIC: [u8; 4] = *b"SRRP";

/// Size of the fixed frame header in bytes (4+1+1+1+2+2+4 = 15).
pub const HEADER_SIZE: usize = 15;

/// Size of the CRC trailer in bytes.
pub const TRAILER_SIZE: usize = 4;

/// Bytes every frame carries besides anchor and payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Packet category, carried in the header.
///
/// The byte values are the ASCII leaders the protocol has always used, which
/// keeps frames readable in a hex dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    /// Link control (node id sync and friends).
    Ctrl = b'=',
    /// Request addressed to an anchor.
    Request = b'>',
    /// Response to a request.
    Response = b'<',
    /// Subscribe to an anchor.
    Subscribe = b'#',
    /// Cancel a subscription.
    Unsubscribe = b'%',
    /// Publish to every subscriber of an anchor.
    Publish = b'@',
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Ctrl,
        Category::Request,
        Category::Response,
        Category::Subscribe,
        Category::Unsubscribe,
        Category::Publish,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Ctrl => "ctrl",
            Category::Request => "request",
            Category::Response => "response",
            Category::Subscribe => "subscribe",
            Category::Unsubscribe => "unsubscribe",
            Category::Publish => "publish",
        }
    }

    /// Looks a category up by name (`"publish"`) or by its leader (`"@"`).
    pub fn from_name(s: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| {
            c.name().eq_ignore_ascii_case(s) || s.as_bytes() == [c.as_byte()]
        })
    }
}

impl TryFrom<u8> for Category {
    type Error = SrrpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'=' => Ok(Category::Ctrl),
            b'>' => Ok(Category::Request),
            b'<' => Ok(Category::Response),
            b'#' => Ok(Category::Subscribe),
            b'%' => Ok(Category::Unsubscribe),
            b'@' => Ok(Category::Publish),
            other => Err(SrrpError::InvalidCategory(other)),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packet flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// More fragments of the same packet follow.
    pub const MORE: u8 = 1 << 0;

    /// Valid flags mask for protocol version 1.
    const VALID_V1_MASK: u8 = 0x01;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_more(mut self) -> Self {
        self.0 |= Self::MORE;
        self
    }

    pub fn without_more(mut self) -> Self {
        self.0 &= !Self::MORE;
        self
    }

    pub fn has_more(&self) -> bool {
        self.0 & Self::MORE != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self, SrrpError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(SrrpError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// One parsed or constructed SRRP frame.
///
/// A packet is immutable: `raw` is always the canonical encoding of the other
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    category: Category,
    flags: PacketFlags,
    leader: u16,
    anchor: String,
    payload: Bytes,
    raw: Bytes,
}

impl Packet {
    /// Builds a complete (unfragmented) packet.
    pub fn new(
        category: Category,
        leader: u16,
        anchor: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::with_flags(category, PacketFlags::new(), leader, anchor, payload)
    }

    /// Builds a packet with explicit flags.
    pub fn with_flags(
        category: Category,
        flags: PacketFlags,
        leader: u16,
        anchor: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        let anchor = anchor.into();
        let payload = payload.into();
        validate_anchor(&anchor, None)?;
        check_payload_len(payload.len())?;
        let raw = encode_frame(category, flags, leader, &anchor, &payload);
        Ok(Self {
            category,
            flags,
            leader,
            anchor,
            payload,
            raw,
        })
    }

    /// Control packet, e.g. `Packet::ctrl(0x1111, "/sync", "")`.
    pub fn ctrl(leader: u16, anchor: &str, payload: impl Into<Bytes>) -> Result<Self, SrrpError> {
        Self::new(Category::Ctrl, leader, anchor, payload)
    }

    pub fn request(
        leader: u16,
        anchor: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::new(Category::Request, leader, anchor, payload)
    }

    pub fn response(
        leader: u16,
        anchor: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::new(Category::Response, leader, anchor, payload)
    }

    pub fn subscribe(
        leader: u16,
        anchor: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::new(Category::Subscribe, leader, anchor, payload)
    }

    pub fn unsubscribe(
        leader: u16,
        anchor: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::new(Category::Unsubscribe, leader, anchor, payload)
    }

    pub fn publish(
        leader: u16,
        anchor: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, SrrpError> {
        Self::new(Category::Publish, leader, anchor, payload)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn leader(&self) -> u16 {
        self.leader
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// The canonical wire form of this packet.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Total encoded length in bytes.
    pub fn frame_len(&self) -> usize {
        self.raw.len()
    }

    /// Returns false for every fragment except the last one.
    pub fn is_final(&self) -> bool {
        !self.flags.has_more()
    }

    /// Splits the payload into fragments of at most `limit` bytes.
    ///
    /// Packets whose payload already fits are returned unchanged. Every
    /// fragment but the last carries the `MORE` flag.
    pub fn split(&self, limit: usize) -> Result<Vec<Packet>, SrrpError> {
        if limit == 0 {
            return Err(SrrpError::ZeroFragmentLimit);
        }
        if self.payload.len() <= limit {
            return Ok(vec![self.clone()]);
        }

        let mut fragments = Vec::with_capacity(self.payload.len().div_ceil(limit));
        let mut start = 0;
        while start < self.payload.len() {
            let end = (start + limit).min(self.payload.len());
            let flags = if end == self.payload.len() {
                self.flags
            } else {
                self.flags.with_more()
            };
            fragments.push(Packet::with_flags(
                self.category,
                flags,
                self.leader,
                self.anchor.clone(),
                self.payload.slice(start..end),
            )?);
            start = end;
        }
        Ok(fragments)
    }

    /// Appends the next fragment to this unfinished packet.
    pub fn concat(&self, next: &Packet) -> Result<Packet, SrrpError> {
        if self.is_final() {
            return Err(SrrpError::FragmentMismatch("packet is already final"));
        }
        if self.category != next.category {
            return Err(SrrpError::FragmentMismatch("category differs"));
        }
        if self.leader != next.leader {
            return Err(SrrpError::FragmentMismatch("leader differs"));
        }
        if self.anchor != next.anchor {
            return Err(SrrpError::FragmentMismatch("anchor differs"));
        }

        let mut payload = BytesMut::with_capacity(self.payload.len() + next.payload.len());
        payload.extend_from_slice(&self.payload);
        payload.extend_from_slice(&next.payload);
        Packet::with_flags(
            self.category,
            next.flags,
            self.leader,
            self.anchor.clone(),
            payload.freeze(),
        )
    }
}

/// Serializes a complete packet into its canonical frame.
pub fn serialize(
    category: Category,
    leader: u16,
    anchor: &str,
    payload: &[u8],
) -> Result<Bytes, SrrpError> {
    validate_anchor(anchor, None)?;
    check_payload_len(payload.len())?;
    Ok(encode_frame(
        category,
        PacketFlags::new(),
        leader,
        anchor,
        payload,
    ))
}

/// Parses exactly one frame from the start of `buf`.
///
/// Returns `Ok(Some((packet, consumed)))` on success, where `consumed` is the
/// frame length; trailing bytes are left for the next call. Returns
/// `Ok(None)` if more data is needed, or `Err` if the bytes cannot be a valid
/// frame. `buf` is never modified.
pub fn parse(buf: &[u8]) -> Result<Option<(Packet, usize)>, SrrpError> {
    let marker_len = buf.len().min(MAGIC.len());
    if buf[..marker_len] != MAGIC[..marker_len] {
        return Err(SrrpError::InvalidMagic(buf[..marker_len].to_vec()));
    }

    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let version = buf[4];
    if version != PROTOCOL_VERSION {
        return Err(SrrpError::UnsupportedVersion(version));
    }

    let category = Category::try_from(buf[5])?;
    let flags = PacketFlags::from_bits(buf[6])?;
    let leader = u16::from_be_bytes([buf[7], buf[8]]);
    let anchor_len = u16::from_be_bytes([buf[9], buf[10]]) as usize;
    let payload_len = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);

    if anchor_len > MAX_ANCHOR_LEN {
        return Err(SrrpError::AnchorTooLong {
            len: anchor_len,
            max: MAX_ANCHOR_LEN,
        });
    }
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(SrrpError::FrameTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total_len = FRAME_OVERHEAD + anchor_len + payload_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let body_end = total_len - TRAILER_SIZE;
    let crc_expected = u32::from_be_bytes([
        buf[body_end],
        buf[body_end + 1],
        buf[body_end + 2],
        buf[body_end + 3],
    ]);
    let crc_actual = crc32c::crc32c(&buf[..body_end]);
    if crc_actual != crc_expected {
        return Err(SrrpError::CrcMismatch {
            expected: crc_expected,
            actual: crc_actual,
            frame_len: total_len,
        });
    }

    let anchor_end = HEADER_SIZE + anchor_len;
    let anchor = std::str::from_utf8(&buf[HEADER_SIZE..anchor_end]).map_err(|_| {
        SrrpError::InvalidAnchor {
            anchor: String::from_utf8_lossy(&buf[HEADER_SIZE..anchor_end]).into_owned(),
            reason: "not valid UTF-8",
            frame_len: Some(total_len),
        }
    })?;
    validate_anchor(anchor, Some(total_len))?;

    let packet = Packet {
        category,
        flags,
        leader,
        anchor: anchor.to_string(),
        payload: Bytes::copy_from_slice(&buf[anchor_end..body_end]),
        raw: Bytes::copy_from_slice(&buf[..total_len]),
    };
    Ok(Some((packet, total_len)))
}

fn encode_frame(
    category: Category,
    flags: PacketFlags,
    leader: u16,
    anchor: &str,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + anchor.len() + payload.len());

    // Marker (4 bytes)
    buf.put_slice(&MAGIC);

    // Version, category, flags (1 byte each)
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(category.as_byte());
    buf.put_u8(flags.bits());

    // Leader (2 bytes)
    buf.put_u16(leader);

    // Field lengths (2 + 4 bytes)
    buf.put_u16(anchor.len() as u16);
    buf.put_u32(payload.len() as u32);

    buf.put_slice(anchor.as_bytes());
    buf.put_slice(payload);

    // CRC32C of everything above (4 bytes)
    let crc = crc32c::crc32c(&buf);
    buf.put_u32(crc);

    buf.freeze()
}

fn validate_anchor(anchor: &str, frame_len: Option<usize>) -> Result<(), SrrpError> {
    if anchor.len() > MAX_ANCHOR_LEN {
        return Err(SrrpError::AnchorTooLong {
            len: anchor.len(),
            max: MAX_ANCHOR_LEN,
        });
    }
    if anchor.is_empty() {
        return Ok(());
    }
    if !anchor.starts_with('/') {
        return Err(SrrpError::InvalidAnchor {
            anchor: anchor.to_string(),
            reason: "must be empty or start with '/'",
            frame_len,
        });
    }
    if anchor.contains('\0') {
        return Err(SrrpError::InvalidAnchor {
            anchor: anchor.to_string(),
            reason: "contains a NUL byte",
            frame_len,
        });
    }
    Ok(())
}

fn check_payload_len(len: usize) -> Result<(), SrrpError> {
    if len > MAX_PAYLOAD_SIZE as usize {
        return Err(SrrpError::FrameTooLarge {
            size: len.min(u32::MAX as usize) as u32,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_name() {
        assert_eq!(Category::from_name("publish"), Some(Category::Publish));
        assert_eq!(Category::from_name("CTRL"), Some(Category::Ctrl));
        assert_eq!(Category::from_name(">"), Some(Category::Request));
        assert_eq!(Category::from_name("%"), Some(Category::Unsubscribe));
        assert_eq!(Category::from_name("pub"), None);
        assert_eq!(Category::from_name(""), None);
    }

    #[test]
    fn test_ctrl_sync_roundtrip() {
        let packet = Packet::ctrl(0x1111, "/sync", "").unwrap();
        let (parsed, consumed) = parse(packet.raw()).unwrap().unwrap();

        assert_eq!(consumed, packet.frame_len());
        assert_eq!(parsed.category(), Category::Ctrl);
        assert_eq!(parsed.leader(), 0x1111);
        assert_eq!(parsed.anchor(), "/sync");
        assert_eq!(parsed.payload().len(), 0);
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_serialize_matches_packet_raw() {
        let raw = serialize(Category::Request, 0x3333, "/hello/x", b"j:{name:'yon'}").unwrap();
        let packet = Packet::request(0x3333, "/hello/x", &b"j:{name:'yon'}"[..]).unwrap();
        assert_eq!(&raw, packet.raw());
        assert_eq!(raw.len(), FRAME_OVERHEAD + "/hello/x".len() + 14);
    }

    #[test]
    fn test_frame_layout() {
        let packet = Packet::publish(0x0102, "/a", &b"xyz"[..]).unwrap();
        let raw = packet.raw();
        assert_eq!(&raw[0..4], b"SRRP");
        assert_eq!(raw[4], PROTOCOL_VERSION);
        assert_eq!(raw[5], b'@');
        assert_eq!(raw[6], 0);
        assert_eq!(&raw[7..9], &[0x01, 0x02]);
        assert_eq!(&raw[9..11], &[0x00, 0x02]);
        assert_eq!(&raw[11..15], &[0, 0, 0, 3]);
        assert_eq!(&raw[15..17], b"/a");
        assert_eq!(&raw[17..20], b"xyz");
        assert_eq!(raw.len(), 24);
    }

    #[test]
    fn test_empty_anchor_and_payload() {
        let packet = Packet::ctrl(0, "", "").unwrap();
        assert_eq!(packet.frame_len(), FRAME_OVERHEAD);
        let (parsed, consumed) = parse(packet.raw()).unwrap().unwrap();
        assert_eq!(consumed, FRAME_OVERHEAD);
        assert_eq!(parsed.anchor(), "");
        assert!(parsed.payload().is_empty());
    }

    #[test]
    fn test_every_prefix_is_incomplete() {
        let packet = Packet::request(7, "/motor/speed", &b"j:{speed:12}"[..]).unwrap();
        let raw = packet.raw();
        for len in 0..raw.len() {
            assert!(
                parse(&raw[..len]).unwrap().is_none(),
                "prefix of {} bytes should be incomplete",
                len
            );
        }
        assert!(parse(raw).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let req = Packet::request(0x3333, "/hello/x", &b"j:{name:'yon'}"[..]).unwrap();
        let resp = Packet::response(0x8888, "/hello/x", &b"j:{err:0}"[..]).unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(req.raw());
        buf.extend_from_slice(resp.raw());

        let (first, used) = parse(&buf).unwrap().unwrap();
        assert_eq!(first, req);
        assert_eq!(used, req.frame_len());

        let (second, used2) = parse(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, resp);
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn test_subscribe_then_publish() {
        let sub = Packet::subscribe(1, "/motor/speed", &b"j:{ack:0,cache:100}"[..]).unwrap();
        let unsub = Packet::unsubscribe(1, "/motor/speed", &b"j:{}"[..]).unwrap();
        let publ = Packet::publish(1, "/motor/speed", &b"j:{speed:12,voltage:24}"[..]).unwrap();

        for packet in [&sub, &unsub, &publ] {
            let (parsed, _) = parse(packet.raw()).unwrap().unwrap();
            assert_eq!(parsed.category(), packet.category());
            assert_eq!(parsed.anchor(), "/motor/speed");
        }

        let mut buf = sub.raw().to_vec();
        buf.extend_from_slice(publ.raw());
        let (first, used) = parse(&buf).unwrap().unwrap();
        assert_eq!(first.category(), Category::Subscribe);
        let (second, _) = parse(&buf[used..]).unwrap().unwrap();
        assert_eq!(second.category(), Category::Publish);
    }

    #[test]
    fn test_crc_validation() {
        let packet = Packet::request(1, "/x", &b"payload"[..]).unwrap();
        let mut raw = packet.raw().to_vec();
        let len = raw.len();
        raw[len - 6] ^= 0xFF;

        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, SrrpError::CrcMismatch { .. }));
        assert_eq!(err.frame_len(), Some(len));
    }

    #[test]
    fn test_invalid_magic() {
        let result = parse(b"BADX\x01=\x00\x00\x00\x00\x00\x00\x00\x00\x00");
        assert!(matches!(result, Err(SrrpError::InvalidMagic(_))));

        // Detected even before the header is complete.
        let result = parse(b"SRX");
        assert!(matches!(result, Err(SrrpError::InvalidMagic(_))));
    }

    #[test]
    fn test_truncated_header_is_incomplete() {
        let packet = Packet::ctrl(0x1111, "/sync", "").unwrap();
        assert!(parse(&packet.raw()[..HEADER_SIZE - 1]).unwrap().is_none());
    }

    #[test]
    fn test_unsupported_version() {
        let mut raw = Packet::ctrl(1, "", "").unwrap().raw().to_vec();
        raw[4] = 99;
        assert!(matches!(parse(&raw), Err(SrrpError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_category() {
        let mut raw = Packet::ctrl(1, "", "").unwrap().raw().to_vec();
        raw[5] = b'!';
        assert!(matches!(parse(&raw), Err(SrrpError::InvalidCategory(b'!'))));
    }

    #[test]
    fn test_invalid_flags() {
        assert!(matches!(
            PacketFlags::from_bits(0x80),
            Err(SrrpError::InvalidFlags(0x80))
        ));

        let mut raw = Packet::ctrl(1, "", "").unwrap().raw().to_vec();
        raw[6] = 0x04;
        assert!(matches!(parse(&raw), Err(SrrpError::InvalidFlags(0x04))));
    }

    #[test]
    fn test_oversized_length_fields_rejected_early() {
        let mut raw = Packet::ctrl(1, "", "").unwrap().raw().to_vec();
        raw[11..15].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(parse(&raw), Err(SrrpError::FrameTooLarge { .. })));

        let mut raw = Packet::ctrl(1, "", "").unwrap().raw().to_vec();
        raw[9..11].copy_from_slice(&((MAX_ANCHOR_LEN + 1) as u16).to_be_bytes());
        assert!(matches!(parse(&raw), Err(SrrpError::AnchorTooLong { .. })));
    }

    #[test]
    fn test_anchor_validation() {
        assert!(Packet::ctrl(1, "/ok/path", "").is_ok());
        assert!(matches!(
            Packet::ctrl(1, "relative", ""),
            Err(SrrpError::InvalidAnchor { .. })
        ));
        assert!(matches!(
            Packet::ctrl(1, "/nul\0", ""),
            Err(SrrpError::InvalidAnchor { .. })
        ));
        let long = format!("/{}", "a".repeat(MAX_ANCHOR_LEN));
        assert!(matches!(
            Packet::ctrl(1, &long, ""),
            Err(SrrpError::AnchorTooLong { .. })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let huge = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
        assert!(matches!(
            Packet::publish(1, "/big", huge),
            Err(SrrpError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_category_bytes() {
        for category in Category::ALL {
            assert_eq!(Category::try_from(category.as_byte()).unwrap(), category);
        }
        assert!(Category::try_from(b'x').is_err());
        assert_eq!(Category::Publish.to_string(), "publish");
    }

    #[test]
    fn test_split_and_concat() {
        let payload: Vec<u8> = (0..250u8).collect();
        let packet = Packet::publish(9, "/stream", payload.clone()).unwrap();

        let fragments = packet.split(100).unwrap();
        assert_eq!(fragments.len(), 3);
        assert!(!fragments[0].is_final());
        assert!(!fragments[1].is_final());
        assert!(fragments[2].is_final());
        assert_eq!(fragments[2].payload().len(), 50);

        let joined = fragments[0]
            .concat(&fragments[1])
            .unwrap()
            .concat(&fragments[2])
            .unwrap();
        assert_eq!(joined, packet);
    }

    #[test]
    fn test_split_small_payload_is_unchanged() {
        let packet = Packet::request(1, "/x", &b"tiny"[..]).unwrap();
        let fragments = packet.split(1400).unwrap();
        assert_eq!(fragments, vec![packet]);
        assert!(matches!(
            Packet::ctrl(1, "", "").unwrap().split(0),
            Err(SrrpError::ZeroFragmentLimit)
        ));
    }

    #[test]
    fn test_concat_rejects_mismatch() {
        let first = Packet::with_flags(
            Category::Publish,
            PacketFlags::new().with_more(),
            1,
            "/a",
            &b"x"[..],
        )
        .unwrap();
        let other_anchor = Packet::publish(1, "/b", &b"y"[..]).unwrap();
        let other_leader = Packet::publish(2, "/a", &b"y"[..]).unwrap();
        let complete = Packet::publish(1, "/a", &b"y"[..]).unwrap();

        assert!(first.concat(&other_anchor).is_err());
        assert!(first.concat(&other_leader).is_err());
        assert!(complete.concat(&first).is_err());
        assert_eq!(first.concat(&complete).unwrap().payload().as_ref(), b"xy");
    }

    #[test]
    fn test_payload_str() {
        let packet = Packet::response(1, "/x", &b"j:{\"err\":0}"[..]).unwrap();
        assert_eq!(packet.payload_str(), Some("j:{\"err\":0}"));
        let binary = Packet::response(1, "/x", vec![0xFF, 0xFE]).unwrap();
        assert_eq!(binary.payload_str(), None);
    }
}
