//! Notifications queued by the poll loop.

use crate::descriptor::Descriptor;
use apix_srrp::Packet;
use bytes::Bytes;

/// Something that happened to a descriptor during [`crate::Context::poll`].
///
/// Events are queued in the order they occurred and drained with
/// [`crate::Context::next_event`]. Ignoring them is fine: the buffers and
/// handle table remain the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An outgoing connection finished connecting.
    Connected(Descriptor),
    /// A listener accepted a new connection.
    Accepted {
        listener: Descriptor,
        descriptor: Descriptor,
    },
    /// New bytes were appended to the read buffer.
    Readable {
        descriptor: Descriptor,
        available: usize,
    },
    /// A packet is ready for [`crate::Context::recv_packet`].
    Packet(Descriptor),
    /// The transport closed and the descriptor was unregistered.
    ///
    /// `residual` holds read-buffer bytes the caller had not consumed yet.
    /// In SRRP mode those bytes are decoded first: `packets` holds every
    /// packet not yet taken with `recv_packet`, including any that arrived
    /// together with the close, and `residual` only an unfinished frame.
    /// `remote_node` is the node id the peer had synced with, if any.
    Closed {
        descriptor: Descriptor,
        residual: Bytes,
        packets: Vec<Packet>,
        remote_node: Option<u16>,
    },
}

impl Event {
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Event::Connected(d) | Event::Packet(d) => *d,
            Event::Accepted { descriptor, .. }
            | Event::Readable { descriptor, .. }
            | Event::Closed { descriptor, .. } => *descriptor,
        }
    }
}
