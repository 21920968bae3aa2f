//! Descriptor handles and the table mapping them to transport state.

use crate::buffer::ByteQueue;
use crate::config::BufferConfig;
use crate::driver::Channel;
use crate::error::ApixError;
use crate::srrp::SrrpLink;
use bytes::Bytes;
use mio::Token;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Opaque handle of one open transport instance.
///
/// Handles are allocated in increasing order and never reused within a
/// context, so a stale handle can only ever fail with
/// [`ApixError::InvalidDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(u32);

impl Descriptor {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Option<Self> {
        u32::try_from(token.0).ok().map(Self)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a descriptor does on its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outgoing connection.
    Connect,
    /// Listening endpoint producing accepted descriptors.
    Listen,
    /// Connection taken off a listener.
    Accept,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Connect => "connect",
            Role::Listen => "listen",
            Role::Accept => "accept",
        }
    }

    /// Single-letter form used in descriptor listings.
    pub fn as_char(self) -> char {
        match self {
            Role::Connect => 'c',
            Role::Listen => 'l',
            Role::Accept => 'a',
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one descriptor.
pub(crate) struct Entry {
    pub kind: String,
    pub role: Role,
    pub peer: String,
    pub parent: Option<Descriptor>,
    pub channel: Box<dyn Channel>,
    pub rx: ByteQueue,
    pub tx: ByteQueue,
    /// Readiness seen and not yet exhausted (cleared on `WouldBlock`).
    pub readable: bool,
    pub writable: bool,
    pub connected: bool,
    /// A listener whose last accept failed is not retried before this.
    pub accept_after: Option<Instant>,
    /// SRRP state of a stream descriptor.
    pub srrp: Option<SrrpLink>,
    /// Node id handed to descriptors accepted by a listener in SRRP mode.
    pub srrp_node: Option<u16>,
    pub opened_at: Instant,
    pub last_recv: Option<Instant>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Entry {
    pub fn info(&self, descriptor: Descriptor) -> DescriptorInfo {
        DescriptorInfo {
            descriptor,
            kind: self.kind.clone(),
            role: self.role,
            peer: self.peer.clone(),
            parent: self.parent,
            connected: self.connected,
            buffered: self.rx.len(),
            pending_write: self.tx.len(),
            srrp: self.srrp.is_some() || self.srrp_node.is_some(),
            remote_node: self.srrp.as_ref().and_then(SrrpLink::remote_id),
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            age: self.opened_at.elapsed(),
            idle: self.last_recv.map(|at| at.elapsed()),
        }
    }
}

/// Snapshot of a descriptor for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub descriptor: Descriptor,
    pub kind: String,
    pub role: Role,
    pub peer: String,
    pub parent: Option<Descriptor>,
    pub connected: bool,
    pub buffered: usize,
    pub pending_write: usize,
    pub srrp: bool,
    pub remote_node: Option<u16>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Time since the descriptor was opened.
    pub age: std::time::Duration,
    /// Time since bytes were last received.
    pub idle: Option<std::time::Duration>,
}

/// Handle-indexed arena of live descriptors.
pub struct DescriptorTable {
    entries: BTreeMap<Descriptor, Entry>,
    next: u32,
    limits: BufferConfig,
}

impl DescriptorTable {
    pub fn new(limits: BufferConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
            limits,
        }
    }

    /// Allocates a handle for `channel` with empty buffers.
    pub fn register(
        &mut self,
        kind: &str,
        role: Role,
        peer: String,
        channel: Box<dyn Channel>,
        parent: Option<Descriptor>,
    ) -> Result<Descriptor, ApixError> {
        let raw = self.next;
        self.next = raw.checked_add(1).ok_or(ApixError::HandlesExhausted)?;
        let descriptor = Descriptor(raw);

        // Accepted streams are already connected and may hold data before
        // their first readiness event.
        let ready = role == Role::Accept;
        self.entries.insert(
            descriptor,
            Entry {
                kind: kind.to_string(),
                role,
                peer,
                parent,
                channel,
                rx: ByteQueue::bounded(self.limits.max_read_buffer),
                tx: ByteQueue::new(self.limits.write_limit()),
                readable: ready,
                writable: ready,
                connected: role != Role::Connect,
                accept_after: None,
                srrp: None,
                srrp_node: None,
                opened_at: Instant::now(),
                last_recv: None,
                bytes_in: 0,
                bytes_out: 0,
            },
        );
        Ok(descriptor)
    }

    pub(crate) fn lookup(&self, descriptor: Descriptor) -> Result<&Entry, ApixError> {
        self.entries
            .get(&descriptor)
            .ok_or(ApixError::InvalidDescriptor(descriptor))
    }

    pub(crate) fn lookup_mut(&mut self, descriptor: Descriptor) -> Result<&mut Entry, ApixError> {
        self.entries
            .get_mut(&descriptor)
            .ok_or(ApixError::InvalidDescriptor(descriptor))
    }

    /// Removes a descriptor. Its handle is never handed out again.
    pub(crate) fn unregister(&mut self, descriptor: Descriptor) -> Result<Entry, ApixError> {
        self.entries
            .remove(&descriptor)
            .ok_or(ApixError::InvalidDescriptor(descriptor))
    }

    pub fn contains(&self, descriptor: Descriptor) -> bool {
        self.entries.contains_key(&descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live handles in allocation order.
    pub fn handles(&self) -> Vec<Descriptor> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Descriptor, &Entry)> {
        self.entries.iter().map(|(d, e)| (*d, e))
    }

    pub fn info(&self, descriptor: Descriptor) -> Result<DescriptorInfo, ApixError> {
        self.lookup(descriptor).map(|entry| entry.info(descriptor))
    }

    /// Appends received bytes to the read buffer.
    pub fn append(&mut self, descriptor: Descriptor, bytes: &[u8]) -> Result<(), ApixError> {
        self.lookup_mut(descriptor)?.rx.append(bytes)
    }

    /// Removes up to `max_len` bytes from the head of the read buffer.
    pub fn consume(&mut self, descriptor: Descriptor, max_len: usize) -> Result<Bytes, ApixError> {
        Ok(self.lookup_mut(descriptor)?.rx.consume(max_len))
    }

    /// Copies buffered bytes into `out`, returning how many were moved.
    pub fn consume_into(&mut self, descriptor: Descriptor, out: &mut [u8]) -> Result<usize, ApixError> {
        Ok(self.lookup_mut(descriptor)?.rx.consume_into(out))
    }

    /// Queues bytes for transmission.
    pub fn enqueue_write(&mut self, descriptor: Descriptor, bytes: &[u8]) -> Result<(), ApixError> {
        self.lookup_mut(descriptor)?.tx.append(bytes)
    }

    /// Removes up to `max_len` queued outbound bytes.
    pub fn drain_write(&mut self, descriptor: Descriptor, max_len: usize) -> Result<Bytes, ApixError> {
        Ok(self.lookup_mut(descriptor)?.tx.consume(max_len))
    }
}

impl fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("live", &self.handles())
            .field("next", &self.next)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::Transfer;
    use mio::event::Source;

    /// Channel backed by an unconnected UDP socket, for table-level tests.
    pub(crate) struct NullChannel {
        socket: mio::net::UdpSocket,
    }

    impl NullChannel {
        pub(crate) fn boxed() -> Box<dyn Channel> {
            let socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            Box::new(NullChannel { socket })
        }
    }

    impl Channel for NullChannel {
        fn source(&mut self) -> &mut dyn Source {
            &mut self.socket
        }

        fn receive(&mut self, _buf: &mut [u8]) -> Transfer {
            Transfer::WouldBlock
        }

        fn transmit(&mut self, bytes: &[u8]) -> Transfer {
            Transfer::Bytes(bytes.len())
        }

        fn close(&mut self) {}
    }

    fn table() -> DescriptorTable {
        DescriptorTable::new(BufferConfig::default())
    }

    #[test]
    fn test_register_allocates_unique_handles() {
        let mut table = table();
        let a = table
            .register("null", Role::Connect, "a".into(), NullChannel::boxed(), None)
            .unwrap();
        let b = table
            .register("null", Role::Connect, "b".into(), NullChannel::boxed(), None)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.handles(), vec![a, b]);
    }

    #[test]
    fn test_handles_not_reused() {
        let mut table = table();
        let a = table
            .register("null", Role::Connect, "a".into(), NullChannel::boxed(), None)
            .unwrap();
        table.unregister(a).unwrap();

        let b = table
            .register("null", Role::Connect, "b".into(), NullChannel::boxed(), None)
            .unwrap();
        assert!(b > a);
        assert!(matches!(
            table.lookup(a),
            Err(ApixError::InvalidDescriptor(d)) if d == a
        ));
    }

    #[test]
    fn test_unregister_twice() {
        let mut table = table();
        let a = table
            .register("null", Role::Listen, "l".into(), NullChannel::boxed(), None)
            .unwrap();
        assert!(table.unregister(a).is_ok());
        assert!(matches!(
            table.unregister(a),
            Err(ApixError::InvalidDescriptor(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_buffer_operations_target_one_descriptor() {
        let mut table = table();
        let a = table
            .register("null", Role::Connect, "a".into(), NullChannel::boxed(), None)
            .unwrap();
        let b = table
            .register("null", Role::Connect, "b".into(), NullChannel::boxed(), None)
            .unwrap();

        table.append(a, b"AB").unwrap();
        table.append(a, b"CD").unwrap();
        table.enqueue_write(b, b"out").unwrap();

        assert_eq!(table.info(a).unwrap().buffered, 4);
        assert_eq!(table.info(b).unwrap().buffered, 0);
        assert_eq!(table.info(b).unwrap().pending_write, 3);

        let mut out = [0u8; 3];
        assert_eq!(table.consume_into(a, &mut out).unwrap(), 3);
        assert_eq!(&out, b"ABC");
        assert_eq!(&table.consume(a, 10).unwrap()[..], b"D");
        assert!(table.consume(a, 10).unwrap().is_empty());

        assert_eq!(&table.drain_write(b, 2).unwrap()[..], b"ou");
        assert_eq!(table.info(b).unwrap().pending_write, 1);
    }

    #[test]
    fn test_read_buffer_limit() {
        let mut table = DescriptorTable::new(BufferConfig {
            max_read_buffer: 4,
            max_write_queue: 2,
        });
        let a = table
            .register("null", Role::Connect, "a".into(), NullChannel::boxed(), None)
            .unwrap();

        table.append(a, b"1234").unwrap();
        assert!(matches!(
            table.append(a, b"5"),
            Err(ApixError::BufferOverflow { .. })
        ));
        assert!(matches!(
            table.enqueue_write(a, b"abc"),
            Err(ApixError::BufferOverflow { len: 3, max: 2 })
        ));
    }

    #[test]
    fn test_initial_state_by_role() {
        let mut table = table();
        let c = table
            .register("null", Role::Connect, "c".into(), NullChannel::boxed(), None)
            .unwrap();
        let a = table
            .register("null", Role::Accept, "a".into(), NullChannel::boxed(), Some(c))
            .unwrap();

        assert!(!table.lookup(c).unwrap().connected);
        let accepted = table.info(a).unwrap();
        assert!(accepted.connected);
        assert_eq!(accepted.parent, Some(c));
        assert_eq!(accepted.role.as_char(), 'a');
    }

    #[test]
    fn test_token_roundtrip() {
        let d = Descriptor::from_raw(42);
        assert_eq!(Descriptor::from_token(d.token()), Some(d));
        assert_eq!(d.to_string(), "#42");
    }
}
