//! SRRP hub: accepts peers, answers subscriptions and forwards publishes.
//!
//! Peers must announce their node id with `/sync` before anything else is
//! served; the node id checks themselves happen in the SRRP link.

use apix_core::{ApixError, Config, Context, Descriptor, Event, Interrupter};
use apix_srrp::{Category, Packet};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// JSON body of the responses the hub generates itself.
fn reply_body(err: u16, msg: Option<&str>) -> String {
    match msg {
        Some(msg) => json!({ "err": err, "msg": msg }).to_string(),
        None => json!({ "err": err }).to_string(),
    }
}

/// Counters reported when the hub stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub accepted: u64,
    pub packets: u64,
    pub forwarded: u64,
}

pub struct Hub {
    ctx: Context,
    node_id: u16,
    listeners: Vec<Descriptor>,
    subscriptions: HashMap<Descriptor, BTreeSet<String>>,
    stats: HubStats,
}

impl Hub {
    /// Opens the configured listeners in SRRP mode.
    pub fn new(config: Config) -> Result<Self, ApixError> {
        let node_id = config.network.node_id;
        let tcp = config.network.tcp_listen.clone();
        let unix = config.network.unix_listen.clone();

        let mut ctx = Context::with_config(config)?;
        ctx.enable_posix()?;

        let mut listeners = Vec::new();
        if let Some(addr) = tcp {
            listeners.push(ctx.open_tcp_server(&addr)?);
        }
        #[cfg(unix)]
        if let Some(path) = unix {
            listeners.push(ctx.open_unix_server(&path.to_string_lossy())?);
        }
        #[cfg(not(unix))]
        if unix.is_some() {
            tracing::warn!("unix_listen is ignored on this platform");
        }

        for &listener in &listeners {
            ctx.enable_srrp_mode(listener, node_id)?;
            let info = ctx.info(listener)?;
            tracing::info!("[{}] listening on {} ({})", listener, info.peer, info.kind);
        }

        Ok(Self {
            ctx,
            node_id,
            listeners,
            subscriptions: HashMap::new(),
            stats: HubStats::default(),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Local addresses of the listeners, in the order they were opened.
    pub fn local_addrs(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter_map(|&l| self.ctx.info(l).ok().map(|info| info.peer))
            .collect()
    }

    pub fn interrupter(&self) -> Result<Interrupter, ApixError> {
        self.ctx.interrupter()
    }

    pub fn stats(&self) -> HubStats {
        self.stats
    }

    /// Descriptors subscribed to exactly `anchor`.
    pub fn subscribers(&self, anchor: &str) -> Vec<Descriptor> {
        let mut subs: Vec<Descriptor> = self
            .subscriptions
            .iter()
            .filter(|(_, anchors)| anchors.contains(anchor))
            .map(|(&d, _)| d)
            .collect();
        subs.sort();
        subs
    }

    /// Serves until `stop` is set. Blocks in the poll between events; use the
    /// [`Interrupter`] to make the flag take effect promptly.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ApixError> {
        while !stop.load(Ordering::Acquire) {
            self.step(-1)?;
        }
        Ok(())
    }

    /// Polls once and handles every queued event.
    pub fn step(&mut self, timeout_ms: i64) -> Result<usize, ApixError> {
        let n = self.ctx.poll(timeout_ms)?;
        while let Some(event) = self.ctx.next_event() {
            self.handle_event(event);
        }
        Ok(n)
    }

    /// Closes every descriptor.
    pub fn shutdown(mut self) -> Result<HubStats, ApixError> {
        self.subscriptions.clear();
        self.ctx.destroy()?;
        Ok(self.stats)
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accepted {
                listener,
                descriptor,
            } => {
                self.stats.accepted += 1;
                let peer = self
                    .ctx
                    .info(descriptor)
                    .map(|i| i.peer)
                    .unwrap_or_default();
                tracing::info!("[{}] accepted on {} from {}", descriptor, listener, peer);
            }
            Event::Packet(d) => loop {
                match self.ctx.recv_packet(d) {
                    Ok(Some(packet)) => self.handle_packet(d, packet),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("[{}] recv_packet: {}", d, e);
                        break;
                    }
                }
            },
            Event::Closed {
                descriptor,
                packets,
                remote_node,
                ..
            } => {
                if let Some(anchors) = self.subscriptions.remove(&descriptor) {
                    tracing::debug!(
                        "[{}] dropped {} subscription(s)",
                        descriptor,
                        anchors.len()
                    );
                }
                // Nobody is left to answer; only publishes still matter.
                for packet in packets {
                    self.stats.packets += 1;
                    if remote_node.is_some() && packet.category() == Category::Publish {
                        self.forward(&packet);
                    } else {
                        tracing::debug!(
                            "[{}] dropped {} {} from closed peer",
                            descriptor,
                            packet.category(),
                            packet.anchor()
                        );
                    }
                }
                tracing::info!("[{}] closed", descriptor);
            }
            Event::Readable { descriptor, .. } => {
                // Only SRRP descriptors are expected here.
                if let Ok(bytes) = self.ctx.consume(descriptor, usize::MAX) {
                    tracing::debug!("[{}] ignored {} raw bytes", descriptor, bytes.len());
                }
            }
            Event::Connected(_) => {}
        }
    }

    fn handle_packet(&mut self, d: Descriptor, packet: Packet) {
        self.stats.packets += 1;
        tracing::trace!(
            "[{}] {} {:#06x} {:?} ({} bytes)",
            d,
            packet.category(),
            packet.leader(),
            packet.anchor(),
            packet.payload().len()
        );

        if packet.category() != Category::Ctrl && !self.is_synced(d) {
            tracing::debug!("[{}] {} before sync", d, packet.category());
            self.reply(d, &packet, reply_body(1, Some("nodeid not sync")));
            return;
        }

        match packet.category() {
            Category::Ctrl => {}
            Category::Subscribe => {
                self.subscriptions
                    .entry(d)
                    .or_default()
                    .insert(packet.anchor().to_string());
                tracing::debug!("[{}] subscribed to {}", d, packet.anchor());
                self.reply(d, &packet, reply_body(0, None));
            }
            Category::Unsubscribe => {
                if let Some(anchors) = self.subscriptions.get_mut(&d) {
                    anchors.remove(packet.anchor());
                    if anchors.is_empty() {
                        self.subscriptions.remove(&d);
                    }
                }
                tracing::debug!("[{}] unsubscribed from {}", d, packet.anchor());
                self.reply(d, &packet, reply_body(0, None));
            }
            Category::Publish => self.forward(&packet),
            Category::Request | Category::Response => {
                self.reply(d, &packet, reply_body(404, Some("Destination not found")));
            }
        }
    }

    fn is_synced(&self, d: Descriptor) -> bool {
        self.ctx
            .info(d)
            .map_or(false, |info| info.remote_node.is_some())
    }

    fn forward(&mut self, packet: &Packet) {
        for target in self.subscribers(packet.anchor()) {
            if self.deliver(target, packet) {
                self.stats.forwarded += 1;
            }
        }
    }

    fn reply(&mut self, d: Descriptor, to: &Packet, body: String) {
        match Packet::response(to.leader(), to.anchor(), body) {
            Ok(response) => {
                self.deliver(d, &response);
            }
            Err(e) => tracing::warn!("[{}] cannot build response: {}", d, e),
        }
    }

    fn deliver(&mut self, d: Descriptor, packet: &Packet) -> bool {
        match self.ctx.send_packet(d, packet) {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                tracing::warn!("[{}] dropped {} packet: {}", d, packet.category(), e);
                false
            }
            Err(e) => {
                tracing::debug!("[{}] send failed: {}", d, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_core::config::NetworkConfig;
    use apix_srrp::{Decoder, CTRL_NODEID_DUP, CTRL_NODEID_ZERO, CTRL_SYNC};
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    const NOT_SYNCED: &str = r#"{"err":1,"msg":"nodeid not sync"}"#;

    fn hub() -> Hub {
        let config = Config {
            network: NetworkConfig {
                node_id: 0xf000,
                tcp_listen: Some("127.0.0.1:0".to_string()),
                unix_listen: None,
            },
            ..Config::default()
        };
        Hub::new(config).unwrap()
    }

    fn client(hub: &Hub, node: u16) -> (Context, Descriptor) {
        let mut ctx = Context::new().unwrap();
        ctx.enable_posix().unwrap();
        let d = ctx.open_tcp_client(&hub.local_addrs()[0]).unwrap();
        ctx.enable_srrp_mode(d, node).unwrap();
        (ctx, d)
    }

    /// Pumps the hub and every client until client `idx` has a packet.
    fn pump_until(
        hub: &mut Hub,
        clients: &mut [&mut (Context, Descriptor)],
        idx: usize,
    ) -> Option<Packet> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            hub.step(5).unwrap();
            for client in clients.iter_mut() {
                let ctx = &mut client.0;
                ctx.poll(5).unwrap();
                while ctx.next_event().is_some() {}
            }
            let (ctx, d) = &mut *clients[idx];
            if let Some(packet) = ctx.recv_packet(*d).unwrap() {
                return Some(packet);
            }
        }
        None
    }

    #[test]
    fn test_subscribe_and_publish() {
        let mut hub = hub();
        let mut sub = client(&hub, 0x0001);
        let mut publisher = client(&hub, 0x0002);

        sub.0
            .send_packet(sub.1, &Packet::subscribe(0x0001, "/motor/speed", "").unwrap())
            .unwrap();
        let reply = pump_until(&mut hub, &mut [&mut sub, &mut publisher], 0).unwrap();
        assert_eq!(reply.category(), Category::Response);
        assert_eq!(reply.anchor(), "/motor/speed");
        assert_eq!(reply.payload_str(), Some(r#"{"err":0}"#));
        assert_eq!(hub.subscribers("/motor/speed").len(), 1);

        publisher
            .0
            .send_packet(publisher.1, &Packet::publish(0x0002, "/motor/speed", "42").unwrap())
            .unwrap();
        let forwarded = pump_until(&mut hub, &mut [&mut sub, &mut publisher], 0).unwrap();
        assert_eq!(forwarded.category(), Category::Publish);
        assert_eq!(forwarded.leader(), 0x0002);
        assert_eq!(forwarded.payload_str(), Some("42"));
        assert_eq!(hub.stats().forwarded, 1);
    }

    #[test]
    fn test_request_without_route() {
        let mut hub = hub();
        let mut c = client(&hub, 0x0003);
        c.0.send_packet(c.1, &Packet::request(0x0003, "/nowhere", "{}").unwrap())
            .unwrap();
        let reply = pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        assert_eq!(reply.category(), Category::Response);
        assert_eq!(
            reply.payload_str(),
            Some(r#"{"err":404,"msg":"Destination not found"}"#)
        );
    }

    #[test]
    fn test_unsubscribe_and_close_drop_subscriptions() {
        let mut hub = hub();
        let mut c = client(&hub, 0x0004);
        for anchor in ["/a", "/b"] {
            c.0.send_packet(c.1, &Packet::subscribe(0x0004, anchor, "").unwrap())
                .unwrap();
            pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        }
        assert_eq!(hub.subscribers("/a").len(), 1);

        c.0.send_packet(c.1, &Packet::unsubscribe(0x0004, "/a", "").unwrap())
            .unwrap();
        pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        assert!(hub.subscribers("/a").is_empty());
        assert_eq!(hub.subscribers("/b").len(), 1);

        c.0.close(c.1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !hub.subscribers("/b").is_empty() && Instant::now() < deadline {
            hub.step(10).unwrap();
        }
        assert!(hub.subscribers("/b").is_empty());

        let stats = hub.shutdown().unwrap();
        assert_eq!(stats.accepted, 1);
    }

    #[test]
    fn test_publish_sent_before_hangup_is_forwarded() {
        let mut hub = hub();
        let mut sub = client(&hub, 0x0010);
        sub.0
            .send_packet(sub.1, &Packet::subscribe(0x0010, "/bye", "").unwrap())
            .unwrap();
        pump_until(&mut hub, &mut [&mut sub], 0).unwrap();

        let publish = Packet::publish(0x0011, "/bye", "last words").unwrap();
        let mut bytes = Packet::ctrl(0x0011, CTRL_SYNC, "").unwrap().raw().to_vec();
        bytes.extend_from_slice(publish.raw());
        {
            let mut peer = TcpStream::connect(&hub.local_addrs()[0]).unwrap();
            peer.write_all(&bytes).unwrap();
        }

        let forwarded = pump_until(&mut hub, &mut [&mut sub], 0).unwrap();
        assert_eq!(forwarded, publish);
        assert_eq!(hub.stats().forwarded, 1);
    }

    #[test]
    fn test_traffic_before_sync_is_refused() {
        let mut hub = hub();
        let mut ctx = Context::new().unwrap();
        ctx.enable_posix().unwrap();
        let d = ctx.open_tcp_client(&hub.local_addrs()[0]).unwrap();
        // Raw mode: no sync is sent.
        ctx.send(d, Packet::request(0x0008, "/echo", "{}").unwrap().raw())
            .unwrap();

        let mut decoder = Decoder::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let reply = loop {
            assert!(Instant::now() < deadline, "no reply from hub");
            hub.step(5).unwrap();
            ctx.poll(5).unwrap();
            while ctx.next_event().is_some() {}
            decoder.extend(&ctx.consume(d, usize::MAX).unwrap());
            match decoder.decode().unwrap() {
                Some(packet) if packet.category() != Category::Ctrl => break packet,
                _ => {}
            }
        };
        assert_eq!(reply.category(), Category::Response);
        assert_eq!(reply.anchor(), "/echo");
        assert_eq!(reply.payload_str(), Some(NOT_SYNCED));
    }

    #[test]
    fn test_zero_node_id_is_not_served() {
        let mut hub = hub();
        let mut c = client(&hub, 0);
        c.0.send_packet(c.1, &Packet::subscribe(0, "/t", "").unwrap())
            .unwrap();

        let rejected = pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        assert_eq!(rejected.category(), Category::Ctrl);
        assert_eq!(rejected.anchor(), CTRL_NODEID_ZERO);
        assert_eq!(rejected.leader(), 0xf000);

        let reply = pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        assert_eq!(reply.payload_str(), Some(NOT_SYNCED));
        assert!(hub.subscribers("/t").is_empty());
    }

    #[test]
    fn test_duplicate_node_id_is_not_served() {
        let mut hub = hub();
        let mut first = client(&hub, 0x0007);
        first
            .0
            .send_packet(first.1, &Packet::subscribe(0x0007, "/a", "").unwrap())
            .unwrap();
        pump_until(&mut hub, &mut [&mut first], 0).unwrap();

        let mut second = client(&hub, 0x0007);
        second
            .0
            .send_packet(second.1, &Packet::subscribe(0x0007, "/b", "").unwrap())
            .unwrap();
        let rejected = pump_until(&mut hub, &mut [&mut first, &mut second], 1).unwrap();
        assert_eq!(rejected.category(), Category::Ctrl);
        assert_eq!(rejected.anchor(), CTRL_NODEID_DUP);

        let reply = pump_until(&mut hub, &mut [&mut first, &mut second], 1).unwrap();
        assert_eq!(reply.payload_str(), Some(NOT_SYNCED));
        assert_eq!(hub.subscribers("/a").len(), 1);
        assert!(hub.subscribers("/b").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let config = Config {
            network: NetworkConfig {
                node_id: 0xf001,
                tcp_listen: None,
                unix_listen: Some(path.clone()),
            },
            ..Config::default()
        };
        let mut hub = Hub::new(config).unwrap();
        assert_eq!(hub.local_addrs().len(), 1);

        let mut ctx = Context::new().unwrap();
        ctx.enable_posix().unwrap();
        let d = ctx.open_unix_client(&path.to_string_lossy()).unwrap();
        ctx.enable_srrp_mode(d, 0x0005).unwrap();
        ctx.send_packet(d, &Packet::subscribe(0x0005, "/x", "").unwrap())
            .unwrap();
        let mut c = (ctx, d);
        let reply = pump_until(&mut hub, &mut [&mut c], 0).unwrap();
        assert_eq!(reply.category(), Category::Response);
        assert_eq!(hub.subscribers("/x").len(), 1);

        hub.shutdown().unwrap();
        assert!(!path.exists());
    }
}
