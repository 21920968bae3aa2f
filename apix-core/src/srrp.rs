//! Per-descriptor SRRP state.
//!
//! A descriptor in SRRP mode no longer exposes raw bytes: the poll loop feeds
//! everything it reads into an [`SrrpLink`], which decodes packets, answers
//! the `/sync` handshake and queues the rest for [`crate::Context::recv_packet`].
//!
//! A peer announcing node id 0 is answered with `/nodeid-zero`. On accepted
//! connections a node id already held elsewhere in the context is answered
//! with `/nodeid-dup`. Either way the peer stays unsynced.

use crate::descriptor::Descriptor;
use apix_srrp::{Category, Decoder, Packet, SrrpError, CTRL_NODEID_DUP, CTRL_NODEID_ZERO, CTRL_SYNC};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Node ids in use inside one context, with the descriptor holding each.
#[derive(Debug, Default, Clone)]
pub struct NodeDirectory {
    owners: HashMap<u16, Descriptor>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: u16, descriptor: Descriptor) {
        self.owners.insert(node, descriptor);
    }

    pub fn owner(&self, node: u16) -> Option<Descriptor> {
        self.owners.get(&node).copied()
    }

    /// Records `node` for `descriptor` unless another descriptor holds it,
    /// in which case the holder is returned.
    pub fn claim(&mut self, node: u16, descriptor: Descriptor) -> Result<(), Descriptor> {
        match self.owner(node) {
            Some(owner) if owner != descriptor => Err(owner),
            _ => {
                self.insert(node, descriptor);
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub struct SrrpLink {
    local_id: u16,
    remote_id: Option<u16>,
    unique_remote: bool,
    decoder: Decoder,
    inbox: VecDeque<Packet>,
    outbox: Vec<Packet>,
    last_sync: Option<Instant>,
    last_progress: Instant,
    malformed: u64,
}

impl SrrpLink {
    pub fn new(local_id: u16) -> Self {
        Self {
            local_id,
            remote_id: None,
            unique_remote: false,
            decoder: Decoder::new(),
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            last_sync: None,
            last_progress: Instant::now(),
            malformed: 0,
        }
    }

    /// A link for a connection taken off a listener: the peer's node id must
    /// not be held by any other descriptor of the context.
    pub fn accepted(local_id: u16) -> Self {
        Self {
            unique_remote: true,
            ..Self::new(local_id)
        }
    }

    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    /// Node id announced by the peer, once a `/sync` was received.
    pub fn remote_id(&self) -> Option<u16> {
        self.remote_id
    }

    /// Number of malformed frames dropped so far.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.decoder.buffered()
    }

    /// Packets ready for the caller.
    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    pub fn pop(&mut self) -> Option<Packet> {
        self.inbox.pop_front()
    }

    /// Removes the bytes of an unfinished frame.
    pub fn take_buffered(&mut self) -> Bytes {
        self.decoder.take_buffered()
    }

    /// Empties the inbox.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.inbox.drain(..).collect()
    }

    /// Control replies generated while decoding, to be written to the peer.
    pub fn take_replies(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    /// Feeds received bytes and decodes as many packets as possible.
    ///
    /// `nodes` and `me` are used to check the node id a peer announces.
    /// A partial frame that has not grown for `parse_timeout` is abandoned.
    /// Returns the number of packets queued for the caller.
    pub fn ingest(
        &mut self,
        bytes: &[u8],
        now: Instant,
        parse_timeout: Duration,
        nodes: &mut NodeDirectory,
        me: Descriptor,
    ) -> usize {
        if !bytes.is_empty() {
            self.decoder.extend(bytes);
            self.last_progress = now;
        }

        let mut queued = 0;
        loop {
            loop {
                match self.decoder.decode() {
                    Ok(Some(packet)) => {
                        self.last_progress = now;
                        if !self.handle_ctrl(&packet, nodes, me) {
                            self.inbox.push_back(packet);
                            queued += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => self.note_malformed(&e),
                }
            }

            if self.decoder.buffered() == 0 || !self.stalled(now, parse_timeout) {
                break;
            }
            let dropped = self.decoder.skip_to_next_frame();
            warn!(
                "partial frame stalled for {:?}, dropped {} bytes",
                parse_timeout, dropped
            );
            self.last_progress = now;
        }
        queued
    }

    /// Returns when the next timer of this link fires.
    pub fn next_deadline(&self, sync_interval: Duration, parse_timeout: Duration) -> Instant {
        let sync = match self.last_sync {
            Some(at) => at + sync_interval,
            None => self.last_progress,
        };
        if self.decoder.buffered() > 0 {
            sync.min(self.last_progress + parse_timeout)
        } else {
            sync
        }
    }

    pub fn sync_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_sync
            .map_or(true, |at| now.duration_since(at) >= interval)
    }

    /// Builds the `/sync` announcement and restarts the sync timer.
    pub fn sync_packet(&mut self, now: Instant) -> Result<Packet, SrrpError> {
        self.last_sync = Some(now);
        Packet::ctrl(self.local_id, CTRL_SYNC, "")
    }

    fn stalled(&self, now: Instant, parse_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_progress) >= parse_timeout
    }

    /// Consumes handshake packets. Returns false for packets meant for the
    /// caller.
    fn handle_ctrl(&mut self, packet: &Packet, nodes: &mut NodeDirectory, me: Descriptor) -> bool {
        if packet.category() != Category::Ctrl {
            return false;
        }
        let node = packet.leader();
        if node == 0 {
            warn!("[{}] peer announced node id 0", me);
            self.reject(CTRL_NODEID_ZERO);
            return true;
        }
        if self.unique_remote {
            if let Some(owner) = nodes.owner(node).filter(|&owner| owner != me) {
                warn!("[{}] node id {:#06x} already held by {}", me, node, owner);
                self.reject(CTRL_NODEID_DUP);
                return true;
            }
        }
        if packet.anchor() != CTRL_SYNC {
            return false;
        }

        if self.remote_id != Some(node) {
            info!("[{}] peer announced node id {:#06x}", me, node);
        }
        self.remote_id = Some(node);
        if self.unique_remote {
            // Checked above, the claim cannot fail.
            let _ = nodes.claim(node, me);
        }
        true
    }

    fn reject(&mut self, anchor: &str) {
        self.remote_id = None;
        match Packet::ctrl(self.local_id, anchor, "") {
            Ok(reply) => self.outbox.push(reply),
            Err(e) => warn!("cannot build {} reply: {}", anchor, e),
        }
    }

    fn note_malformed(&mut self, err: &SrrpError) {
        self.malformed += 1;
        if err.is_malformed() {
            warn!("dropping malformed frame: {}", err);
        } else {
            debug!("decoder: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn feed(link: &mut SrrpLink, bytes: &[u8], now: Instant) -> usize {
        let mut nodes = NodeDirectory::new();
        link.ingest(bytes, now, TIMEOUT, &mut nodes, Descriptor::from_raw(1))
    }

    #[test]
    fn test_sync_sets_remote_id_and_is_not_queued() {
        let mut link = SrrpLink::new(0xf000);
        let sync = Packet::ctrl(0x1111, CTRL_SYNC, "").unwrap();

        assert_eq!(feed(&mut link, sync.raw(), Instant::now()), 0);
        assert_eq!(link.remote_id(), Some(0x1111));
        assert!(link.pop().is_none());
    }

    #[test]
    fn test_packets_are_queued_in_order() {
        let mut link = SrrpLink::new(1);
        let a = Packet::request(7, "/a", &b"1"[..]).unwrap();
        let b = Packet::publish(7, "/b", &b"2"[..]).unwrap();
        let ctrl = Packet::ctrl(3, "/other", "").unwrap();

        let mut bytes = a.raw().to_vec();
        bytes.extend_from_slice(b.raw());
        bytes.extend_from_slice(ctrl.raw());

        assert_eq!(feed(&mut link, &bytes, Instant::now()), 3);
        assert_eq!(link.queued(), 3);
        assert_eq!(link.pop().unwrap(), a);
        assert_eq!(link.pop().unwrap(), b);
        assert_eq!(link.pop().unwrap(), ctrl);
        assert_eq!(link.remote_id(), None);
    }

    #[test]
    fn test_split_arrival() {
        let mut link = SrrpLink::new(1);
        let packet = Packet::response(9, "/reply", &b"{\"err\":0}"[..]).unwrap();
        let (head, tail) = packet.raw().split_at(12);
        let now = Instant::now();

        assert_eq!(feed(&mut link, head, now), 0);
        assert_eq!(link.buffered(), 12);
        assert_eq!(feed(&mut link, tail, now), 1);
        assert_eq!(link.pop().unwrap(), packet);
    }

    #[test]
    fn test_malformed_frame_is_counted_and_skipped() {
        let mut link = SrrpLink::new(1);
        let good = Packet::request(2, "/ok", "").unwrap();
        let mut bad = Packet::request(1, "/bad", &b"xx"[..]).unwrap().raw().to_vec();
        let len = bad.len();
        bad[len - 1] ^= 0xff;
        bad.extend_from_slice(good.raw());

        assert_eq!(feed(&mut link, &bad, Instant::now()), 1);
        assert_eq!(link.malformed(), 1);
        assert_eq!(link.pop().unwrap(), good);
    }

    #[test]
    fn test_stalled_partial_frame_is_dropped() {
        let mut link = SrrpLink::new(1);
        let packet = Packet::request(1, "/slow", &b"abc"[..]).unwrap();
        let start = Instant::now();

        feed(&mut link, &packet.raw()[..8], start);
        assert_eq!(link.buffered(), 8);

        feed(&mut link, &[], start + Duration::from_millis(500));
        assert_eq!(link.buffered(), 8);

        feed(&mut link, &[], start + Duration::from_millis(1500));
        assert_eq!(link.buffered(), 0);

        let later = start + Duration::from_millis(1600);
        assert_eq!(feed(&mut link, packet.raw(), later), 1);
    }

    #[test]
    fn test_sync_timer() {
        let mut link = SrrpLink::new(0x2222);
        let interval = Duration::from_secs(5);
        let start = Instant::now();
        assert!(link.sync_due(start, interval));

        let sync = link.sync_packet(start).unwrap();
        assert_eq!(sync.leader(), 0x2222);
        assert_eq!(sync.anchor(), CTRL_SYNC);
        assert_eq!(sync.category(), Category::Ctrl);

        assert!(!link.sync_due(start + Duration::from_secs(1), interval));
        assert!(link.sync_due(start + Duration::from_secs(5), interval));
        assert_eq!(link.next_deadline(interval, TIMEOUT), start + interval);
    }

    #[test]
    fn test_node_id_zero_is_rejected() {
        let mut link = SrrpLink::new(0xf000);
        let sync = Packet::ctrl(0, CTRL_SYNC, "").unwrap();

        assert_eq!(feed(&mut link, sync.raw(), Instant::now()), 0);
        assert_eq!(link.remote_id(), None);
        let replies = link.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].category(), Category::Ctrl);
        assert_eq!(replies[0].anchor(), CTRL_NODEID_ZERO);
        assert_eq!(replies[0].leader(), 0xf000);
        assert!(link.take_replies().is_empty());
    }

    #[test]
    fn test_duplicate_node_id_on_accepted_link() {
        let holder = Descriptor::from_raw(1);
        let me = Descriptor::from_raw(2);
        let mut nodes = NodeDirectory::new();
        nodes.insert(0x1111, holder);

        let sync = Packet::ctrl(0x1111, CTRL_SYNC, "").unwrap();
        let mut link = SrrpLink::accepted(0xf000);
        assert_eq!(link.ingest(sync.raw(), Instant::now(), TIMEOUT, &mut nodes, me), 0);
        assert_eq!(link.remote_id(), None);
        assert_eq!(link.take_replies()[0].anchor(), CTRL_NODEID_DUP);

        // The holder itself may sync again.
        let mut link = SrrpLink::accepted(0xf000);
        link.ingest(sync.raw(), Instant::now(), TIMEOUT, &mut nodes, holder);
        assert_eq!(link.remote_id(), Some(0x1111));
        assert!(link.take_replies().is_empty());

        // A fresh id is claimed.
        let other = Packet::ctrl(0x2222, CTRL_SYNC, "").unwrap();
        let mut link = SrrpLink::accepted(0xf000);
        link.ingest(other.raw(), Instant::now(), TIMEOUT, &mut nodes, me);
        assert_eq!(link.remote_id(), Some(0x2222));
        assert_eq!(nodes.owner(0x2222), Some(me));
        assert_eq!(nodes.claim(0x2222, holder), Err(me));
    }

    #[test]
    fn test_outgoing_link_ignores_directory() {
        let mut nodes = NodeDirectory::new();
        nodes.insert(0xf000, Descriptor::from_raw(1));

        let sync = Packet::ctrl(0xf000, CTRL_SYNC, "").unwrap();
        let mut link = SrrpLink::new(0x1111);
        link.ingest(sync.raw(), Instant::now(), TIMEOUT, &mut nodes, Descriptor::from_raw(2));
        assert_eq!(link.remote_id(), Some(0xf000));
        assert!(link.take_replies().is_empty());
    }
}
