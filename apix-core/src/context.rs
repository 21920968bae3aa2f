//! The poll loop.
//!
//! A [`Context`] owns every descriptor, its buffers and the enabled transport
//! drivers. Each [`Context::poll`] call waits for readiness (bounded by the
//! caller's timeout), reads ready descriptors into their read buffers, runs
//! SRRP decoding and timers, and flushes queued writes. Nothing happens
//! between polls: `send` only queues, `read_from_buffer` only copies.

use crate::buffer::ByteQueue;
use crate::config::Config;
use crate::descriptor::{Descriptor, DescriptorInfo, DescriptorTable, Entry, Role};
use crate::driver::{Driver, DriverRegistry, Opened, Transfer};
use crate::error::ApixError;
use crate::event::Event;
use crate::srrp::{NodeDirectory, SrrpLink};
use crate::tcp::{TcpClientDriver, TcpServerDriver};
use crate::{TCP_CLIENT, TCP_SERVER};
use apix_srrp::Packet;
use bytes::Bytes;
use mio::{Events, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Connections accepted from one listener per poll.
const ACCEPT_BUDGET: usize = 64;

/// Pause before retrying a listener whose accept failed (e.g. EMFILE).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Wakes a [`Context`] blocked in [`Context::poll`] from another thread.
#[derive(Clone)]
pub struct Interrupter {
    waker: Arc<Waker>,
}

impl Interrupter {
    pub fn interrupt(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Interrupter")
    }
}

/// Loop parameters copied out of [`Config`].
#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    read_chunk: usize,
    read_budget: usize,
    sync_interval: Duration,
    parse_timeout: Duration,
}

impl LoopSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            read_chunk: config.poll.read_chunk_size,
            read_budget: config.poll.read_budget,
            sync_interval: config.srrp.sync_interval(),
            parse_timeout: config.srrp.parse_timeout(),
        }
    }
}

/// Outcome of servicing one stream descriptor.
struct Serviced {
    active: bool,
    closed: Option<&'static str>,
}

/// Owner of descriptors and drivers; single-threaded.
pub struct Context {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    drivers: DriverRegistry,
    table: DescriptorTable,
    pending: VecDeque<Event>,
    config: Config,
    settings: LoopSettings,
    scratch: Vec<u8>,
    destroyed: bool,
}

impl Context {
    /// Creates a context with default configuration and no transports.
    pub fn new() -> Result<Self, ApixError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, ApixError> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            events: Events::with_capacity(config.poll.event_capacity),
            table: DescriptorTable::new(config.buffer.clone()),
            settings: LoopSettings::from_config(&config),
            scratch: vec![0u8; config.poll.read_chunk_size],
            poll,
            waker,
            drivers: DriverRegistry::new(),
            pending: VecDeque::new(),
            config,
            destroyed: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_alive(&self) -> Result<(), ApixError> {
        if self.destroyed {
            Err(ApixError::ContextDestroyed)
        } else {
            Ok(())
        }
    }

    // --- transports ---

    /// Registers a transport driver under its kind tag.
    pub fn enable(&mut self, driver: Box<dyn Driver>) -> Result<(), ApixError> {
        self.ensure_alive()?;
        let kind = driver.kind().to_string();
        self.drivers.enable(driver)?;
        info!("transport {} enabled", kind);
        Ok(())
    }

    /// Enables the TCP drivers and, on Unix, the Unix socket drivers.
    /// Kinds that are already enabled are left alone.
    pub fn enable_posix(&mut self) -> Result<(), ApixError> {
        self.ensure_alive()?;
        for driver in posix_drivers() {
            if !self.drivers.is_enabled(driver.kind()) {
                self.enable(driver)?;
            }
        }
        Ok(())
    }

    /// Closes every descriptor of `kind` and unregisters its driver.
    pub fn disable(&mut self, kind: &str) -> Result<(), ApixError> {
        self.ensure_alive()?;
        self.drivers.disable(kind)?;

        let doomed: Vec<Descriptor> = self
            .table
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(d, _)| d)
            .collect();
        for d in &doomed {
            self.close(*d)?;
        }
        info!("transport {} disabled, closed {} descriptors", kind, doomed.len());
        Ok(())
    }

    /// Kind tags of the enabled drivers.
    pub fn transports(&self) -> Result<Vec<&str>, ApixError> {
        self.ensure_alive()?;
        Ok(self.drivers.kinds())
    }

    // --- descriptors ---

    /// Opens a transport instance through the driver registered as `kind`.
    ///
    /// The descriptor is usable immediately; a connection still in progress
    /// completes during later polls and is reported as [`Event::Connected`].
    pub fn open(&mut self, kind: &str, addr: &str) -> Result<Descriptor, ApixError> {
        self.ensure_alive()?;
        let opened = self.drivers.get_mut(kind)?.open(addr)?;
        self.install(kind, opened, None)
    }

    pub fn open_tcp_client(&mut self, addr: &str) -> Result<Descriptor, ApixError> {
        self.open(TCP_CLIENT, addr)
    }

    pub fn open_tcp_server(&mut self, addr: &str) -> Result<Descriptor, ApixError> {
        self.open(TCP_SERVER, addr)
    }

    #[cfg(unix)]
    pub fn open_unix_client(&mut self, path: &str) -> Result<Descriptor, ApixError> {
        self.open(crate::UNIX_CLIENT, path)
    }

    #[cfg(unix)]
    pub fn open_unix_server(&mut self, path: &str) -> Result<Descriptor, ApixError> {
        self.open(crate::UNIX_SERVER, path)
    }

    fn install(
        &mut self,
        kind: &str,
        opened: Opened,
        parent: Option<Descriptor>,
    ) -> Result<Descriptor, ApixError> {
        let Opened {
            channel,
            role,
            peer,
        } = opened;
        let d = self.table.register(kind, role, peer, channel, parent)?;

        let entry = self.table.lookup_mut(d)?;
        let interest = entry.channel.interest();
        if let Err(e) = self
            .poll
            .registry()
            .register(entry.channel.source(), d.token(), interest)
        {
            if let Ok(mut entry) = self.table.unregister(d) {
                entry.channel.close();
            }
            return Err(e.into());
        }

        let entry = self.table.lookup(d)?;
        debug!("[{}] opened {} {} ({})", d, entry.kind, entry.peer, entry.role);
        Ok(d)
    }

    /// Closes a descriptor immediately. Unsent bytes are discarded.
    pub fn close(&mut self, d: Descriptor) -> Result<(), ApixError> {
        self.ensure_alive()?;
        let mut entry = self.table.unregister(d)?;
        self.release(&mut entry);
        debug!(
            "[{}] closed {} {} ({} bytes unread, {} unsent)",
            d,
            entry.kind,
            entry.peer,
            entry.rx.len(),
            entry.tx.len()
        );
        Ok(())
    }

    /// Closes every descriptor and releases the drivers.
    ///
    /// Every later operation, including a second `destroy`, fails with
    /// [`ApixError::ContextDestroyed`].
    pub fn destroy(&mut self) -> Result<(), ApixError> {
        self.ensure_alive()?;
        let handles = self.table.handles();
        for d in &handles {
            if let Ok(mut entry) = self.table.unregister(*d) {
                self.release(&mut entry);
            }
        }
        self.drivers.clear();
        self.pending.clear();
        self.destroyed = true;
        info!("context destroyed, closed {} descriptors", handles.len());
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn release(&mut self, entry: &mut Entry) {
        if let Err(e) = self.poll.registry().deregister(entry.channel.source()) {
            trace!("deregister failed: {}", e);
        }
        entry.channel.close();
    }

    /// Unregisters a descriptor whose transport failed and reports it.
    fn terminate(&mut self, d: Descriptor, reason: &str) {
        let Ok(mut entry) = self.table.unregister(d) else {
            return;
        };
        self.release(&mut entry);
        let mut residual = entry.rx.take_all();
        let mut packets = Vec::new();
        let mut remote_node = None;
        if let Some(link) = entry.srrp.as_mut() {
            // Frames that arrived together with the close still count.
            let mut nodes = node_directory(&self.table);
            link.ingest(&residual, Instant::now(), self.settings.parse_timeout, &mut nodes, d);
            packets = link.drain();
            residual = link.take_buffered();
            remote_node = link.remote_id();
        }
        info!(
            "[{}] {} {} closed: {} ({} bytes unread, {} unsent, {} packets unread)",
            d,
            entry.kind,
            entry.peer,
            reason,
            residual.len(),
            entry.tx.len(),
            packets.len()
        );
        self.pending.push_back(Event::Closed {
            descriptor: d,
            residual,
            packets,
            remote_node,
        });
    }

    // --- data ---

    /// Queues bytes for transmission on the next polls. Never blocks.
    pub fn send(&mut self, d: Descriptor, bytes: &[u8]) -> Result<(), ApixError> {
        self.ensure_alive()?;
        self.require_stream(d, "send")?;
        self.table.enqueue_write(d, bytes)?;
        trace!("[{}] queued {} bytes", d, bytes.len());
        Ok(())
    }

    /// Writes straight to the transport, bypassing the write queue.
    ///
    /// Fails with [`ApixError::WouldBlock`] when the transport is not ready
    /// or queued bytes are still waiting, so ordering is preserved.
    pub fn send_direct(&mut self, d: Descriptor, bytes: &[u8]) -> Result<usize, ApixError> {
        self.ensure_alive()?;
        self.require_stream(d, "send")?;
        let entry = self.table.lookup_mut(d)?;
        if !entry.connected || !entry.tx.is_empty() {
            return Err(ApixError::WouldBlock);
        }
        match entry.channel.transmit(bytes) {
            Transfer::Bytes(n) => {
                entry.bytes_out += n as u64;
                Ok(n)
            }
            Transfer::WouldBlock => {
                entry.writable = false;
                Err(ApixError::WouldBlock)
            }
            Transfer::Closed => {
                self.terminate(d, "write failed");
                Err(ApixError::Disconnected(d))
            }
        }
    }

    /// Copies buffered bytes into `buf` and removes them from the read buffer.
    /// Returns 0 when nothing is buffered.
    pub fn read_from_buffer(&mut self, d: Descriptor, buf: &mut [u8]) -> Result<usize, ApixError> {
        self.ensure_alive()?;
        self.table.consume_into(d, buf)
    }

    /// Removes up to `max_len` buffered bytes.
    pub fn consume(&mut self, d: Descriptor, max_len: usize) -> Result<Bytes, ApixError> {
        self.ensure_alive()?;
        self.table.consume(d, max_len)
    }

    fn require_stream(&self, d: Descriptor, operation: &'static str) -> Result<(), ApixError> {
        let entry = self.table.lookup(d)?;
        if entry.role == Role::Listen {
            return Err(ApixError::Unsupported {
                descriptor: d,
                kind: entry.kind.clone(),
                operation,
            });
        }
        Ok(())
    }

    // --- SRRP mode ---

    /// Switches a descriptor to SRRP mode with `node_id` as the local identity.
    ///
    /// On a listener the mode is applied to every connection it accepts
    /// afterwards. Bytes already buffered are handed to the decoder.
    pub fn enable_srrp_mode(&mut self, d: Descriptor, node_id: u16) -> Result<(), ApixError> {
        self.ensure_alive()?;
        let parse_timeout = self.settings.parse_timeout;
        let mut nodes = node_directory(&self.table);
        let entry = self.table.lookup_mut(d)?;

        if entry.role == Role::Listen {
            entry.srrp_node = Some(node_id);
            info!("[{}] srrp mode for accepted connections, node {:#06x}", d, node_id);
            return Ok(());
        }
        if entry.srrp.is_some() {
            debug!("[{}] srrp mode already enabled", d);
            return Ok(());
        }

        let mut link = if entry.role == Role::Accept {
            SrrpLink::accepted(node_id)
        } else {
            SrrpLink::new(node_id)
        };
        let now = Instant::now();
        // The first sync precedes anything queued after this call.
        match link.sync_packet(now) {
            Ok(sync) => queue_control(d, &mut entry.tx, vec![sync]),
            Err(e) => warn!("[{}] cannot build sync: {}", d, e),
        }
        let held = entry.rx.take_all();
        let queued = link.ingest(&held, now, parse_timeout, &mut nodes, d);
        queue_control(d, &mut entry.tx, link.take_replies());
        entry.srrp = Some(link);
        for _ in 0..queued {
            self.pending.push_back(Event::Packet(d));
        }
        info!("[{}] srrp mode enabled, node {:#06x}", d, node_id);
        Ok(())
    }

    /// Returns a descriptor to raw byte mode. Undelivered packets are dropped.
    pub fn disable_srrp_mode(&mut self, d: Descriptor) -> Result<(), ApixError> {
        self.ensure_alive()?;
        let entry = self.table.lookup_mut(d)?;
        entry.srrp_node = None;
        if let Some(link) = entry.srrp.take() {
            debug!(
                "[{}] srrp mode disabled ({} packets dropped)",
                d,
                link.queued()
            );
        }
        Ok(())
    }

    /// Queues a packet, fragmenting payloads above the configured limit.
    ///
    /// Either every fragment is queued or none is.
    pub fn send_packet(&mut self, d: Descriptor, packet: &Packet) -> Result<(), ApixError> {
        self.ensure_alive()?;
        self.require_stream(d, "send_packet")?;
        let fragments = packet.split(self.config.srrp.payload_limit)?;

        let total: usize = fragments.iter().map(Packet::frame_len).sum();
        let entry = self.table.lookup(d)?;
        if let Some(max) = entry.tx.limit() {
            if entry.tx.len() + total > max {
                return Err(ApixError::BufferOverflow {
                    len: entry.tx.len() + total,
                    max,
                });
            }
        }

        for fragment in &fragments {
            self.table.enqueue_write(d, fragment.raw())?;
        }
        trace!(
            "[{}] queued {} packet {:?} in {} frames",
            d,
            packet.category(),
            packet.anchor(),
            fragments.len()
        );
        Ok(())
    }

    /// Takes the next decoded packet of a descriptor in SRRP mode.
    pub fn recv_packet(&mut self, d: Descriptor) -> Result<Option<Packet>, ApixError> {
        self.ensure_alive()?;
        let entry = self.table.lookup_mut(d)?;
        match entry.srrp.as_mut() {
            Some(link) => Ok(link.pop()),
            None => Err(ApixError::Unsupported {
                descriptor: d,
                kind: entry.kind.clone(),
                operation: "recv_packet",
            }),
        }
    }

    // --- events and introspection ---

    /// Takes the oldest queued event.
    ///
    /// Draining the queue cannot fail: `destroy` discards pending events, so
    /// a destroyed context simply has none.
    pub fn next_event(&mut self) -> Option<Event> {
        self.pending.pop_front()
    }

    pub fn interrupter(&self) -> Result<Interrupter, ApixError> {
        self.ensure_alive()?;
        Ok(Interrupter {
            waker: Arc::clone(&self.waker),
        })
    }

    pub fn descriptors(&self) -> Result<Vec<DescriptorInfo>, ApixError> {
        self.ensure_alive()?;
        Ok(self.table.iter().map(|(d, entry)| entry.info(d)).collect())
    }

    pub fn info(&self, d: Descriptor) -> Result<DescriptorInfo, ApixError> {
        self.ensure_alive()?;
        self.table.info(d)
    }

    /// Bytes waiting in the read buffer.
    pub fn buffered(&self, d: Descriptor) -> Result<usize, ApixError> {
        self.ensure_alive()?;
        Ok(self.table.lookup(d)?.rx.len())
    }

    /// Bytes queued but not yet accepted by the transport.
    pub fn pending_write(&self, d: Descriptor) -> Result<usize, ApixError> {
        self.ensure_alive()?;
        Ok(self.table.lookup(d)?.tx.len())
    }

    // --- the loop ---

    /// Runs one loop iteration, waiting at most `timeout_ms` for readiness.
    ///
    /// `0` returns at once when nothing is ready; a negative timeout waits
    /// until something happens or an [`Interrupter`] fires. Returns the
    /// number of descriptors that saw activity.
    pub fn poll(&mut self, timeout_ms: i64) -> Result<usize, ApixError> {
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        self.poll_timeout(timeout)
    }

    /// Like [`Context::poll`], with `None` meaning no limit.
    pub fn poll_timeout(&mut self, timeout: Option<Duration>) -> Result<usize, ApixError> {
        self.ensure_alive()?;
        let timeout = self.effective_timeout(timeout, Instant::now());

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                trace!("poll interrupted");
                continue;
            }
            let Some(d) = Descriptor::from_token(event.token()) else {
                continue;
            };
            if let Ok(entry) = self.table.lookup_mut(d) {
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    entry.readable = true;
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    entry.writable = true;
                }
            }
        }

        let now = Instant::now();
        let mut nodes = node_directory(&self.table);
        let mut active = 0;
        for d in self.table.handles() {
            let Ok(entry) = self.table.lookup(d) else {
                continue;
            };
            let busy = if entry.role == Role::Listen {
                self.accept_pending(d, now)
            } else {
                self.service(d, now, &mut nodes)
            };
            if busy {
                active += 1;
            }
        }
        Ok(active)
    }

    /// Shortens the caller's timeout when work is already pending or an SRRP
    /// timer is about to fire.
    fn effective_timeout(&self, requested: Option<Duration>, now: Instant) -> Option<Duration> {
        let mut deadline: Option<Instant> = None;
        for (_, entry) in self.table.iter() {
            if let Some(at) = entry.accept_after.filter(|&at| at > now) {
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
                continue;
            }
            if has_ready_work(entry) {
                return Some(Duration::ZERO);
            }
            if let (Some(link), true) = (entry.srrp.as_ref(), entry.connected) {
                let at = link.next_deadline(self.settings.sync_interval, self.settings.parse_timeout);
                deadline = Some(deadline.map_or(at, |d| d.min(at)));
            }
        }

        match deadline {
            None => requested,
            Some(at) => {
                let until = at.saturating_duration_since(now);
                Some(requested.map_or(until, |t| t.min(until)))
            }
        }
    }

    fn accept_pending(&mut self, listener: Descriptor, now: Instant) -> bool {
        let mut accepted = Vec::new();
        let (kind, srrp_node) = {
            let Ok(entry) = self.table.lookup_mut(listener) else {
                return false;
            };
            if !entry.readable || entry.accept_after.is_some_and(|at| at > now) {
                return false;
            }
            entry.accept_after = None;
            while accepted.len() < ACCEPT_BUDGET {
                match entry.channel.accept() {
                    Ok(Some(conn)) => accepted.push(conn),
                    Ok(None) => {
                        entry.readable = false;
                        break;
                    }
                    Err(e) => {
                        // The backlog may still hold connections and no new
                        // edge will announce them: stay readable, retry later.
                        warn!("[{}] accept failed: {}", listener, e);
                        entry.accept_after = Some(now + ACCEPT_BACKOFF);
                        break;
                    }
                }
            }
            (entry.kind.clone(), entry.srrp_node)
        };

        let busy = !accepted.is_empty();
        for conn in accepted {
            let peer = conn.peer.clone();
            let opened = Opened {
                channel: conn.channel,
                role: Role::Accept,
                peer: conn.peer,
            };
            match self.install(&kind, opened, Some(listener)) {
                Ok(d) => {
                    info!("[{}] accepted {} as {}", listener, peer, d);
                    self.pending.push_back(Event::Accepted {
                        listener,
                        descriptor: d,
                    });
                    if let Some(node) = srrp_node {
                        if let Err(e) = self.enable_srrp_mode(d, node) {
                            warn!("[{}] cannot enable srrp mode: {}", d, e);
                        }
                    }
                }
                Err(e) => warn!("[{}] dropping connection from {}: {}", listener, peer, e),
            }
        }
        busy
    }

    fn service(&mut self, d: Descriptor, now: Instant, nodes: &mut NodeDirectory) -> bool {
        let settings = self.settings;
        let outcome = match self.table.lookup_mut(d) {
            Ok(entry) => service_stream(
                d,
                entry,
                &mut self.scratch,
                &settings,
                now,
                nodes,
                &mut self.pending,
            ),
            Err(_) => return false,
        };
        if let Some(reason) = outcome.closed {
            self.terminate(d, reason);
            return true;
        }
        outcome.active
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = self.destroy();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("drivers", &self.drivers)
            .field("table", &self.table)
            .field("pending_events", &self.pending.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

fn posix_drivers() -> Vec<Box<dyn Driver>> {
    #[allow(unused_mut)]
    let mut drivers: Vec<Box<dyn Driver>> = vec![Box::new(TcpClientDriver), Box::new(TcpServerDriver)];
    #[cfg(unix)]
    {
        drivers.push(Box::new(crate::unix::UnixClientDriver));
        drivers.push(Box::new(crate::unix::UnixServerDriver));
    }
    drivers
}

/// Node ids claimed inside the context: those of SRRP listeners and those
/// announced by peers on accepted connections.
fn node_directory(table: &DescriptorTable) -> NodeDirectory {
    let mut nodes = NodeDirectory::new();
    for (d, entry) in table.iter() {
        match entry.role {
            Role::Listen => {
                if let Some(node) = entry.srrp_node {
                    nodes.insert(node, d);
                }
            }
            Role::Accept => {
                if let Some(node) = entry.srrp.as_ref().and_then(SrrpLink::remote_id) {
                    nodes.insert(node, d);
                }
            }
            Role::Connect => {}
        }
    }
    nodes
}

fn queue_control(d: Descriptor, tx: &mut ByteQueue, packets: Vec<Packet>) {
    for packet in packets {
        if let Err(e) = tx.append(packet.raw()) {
            warn!("[{}] cannot queue {}: {}", d, packet.anchor(), e);
        }
    }
}

fn has_ready_work(entry: &Entry) -> bool {
    match entry.role {
        Role::Listen => entry.readable,
        _ if !entry.connected => false,
        _ => {
            (entry.readable && entry.rx.remaining() > 0)
                || (entry.writable && !entry.tx.is_empty())
        }
    }
}

/// Moves bytes for one stream descriptor: finish connecting, read, run SRRP,
/// then flush the write queue.
fn service_stream(
    d: Descriptor,
    entry: &mut Entry,
    scratch: &mut [u8],
    settings: &LoopSettings,
    now: Instant,
    nodes: &mut NodeDirectory,
    events: &mut VecDeque<Event>,
) -> Serviced {
    let mut active = false;

    if !entry.connected && (entry.readable || entry.writable) {
        match entry.channel.finish_connect() {
            Ok(true) => {
                entry.connected = true;
                active = true;
                info!("[{}] connected to {}", d, entry.peer);
                events.push_back(Event::Connected(d));
            }
            Ok(false) => {}
            Err(e) => {
                warn!("[{}] connect to {} failed: {}", d, entry.peer, e);
                return Serviced {
                    active: true,
                    closed: Some("connect failed"),
                };
            }
        }
    }
    if !entry.connected {
        return Serviced {
            active,
            closed: None,
        };
    }

    // read
    let mut received = 0;
    let mut closed = None;
    if entry.readable {
        let mut budget = settings.read_budget;
        while budget > 0 {
            let room = entry.rx.remaining();
            if room == 0 {
                trace!("[{}] read buffer full, pausing reads", d);
                break;
            }
            let want = settings.read_chunk.min(room).min(budget).min(scratch.len());
            match entry.channel.receive(&mut scratch[..want]) {
                Transfer::Bytes(n) => {
                    // `n <= room`, so the append cannot overflow.
                    if let Err(e) = entry.rx.append(&scratch[..n]) {
                        warn!("[{}] {}", d, e);
                        break;
                    }
                    received += n;
                    budget -= n;
                }
                Transfer::WouldBlock => {
                    entry.readable = false;
                    break;
                }
                Transfer::Closed => {
                    closed = Some("closed by peer");
                    break;
                }
            }
        }
    }
    if received > 0 {
        active = true;
        entry.bytes_in += received as u64;
        entry.last_recv = Some(now);
        trace!("[{}] received {} bytes", d, received);
    }

    if closed.is_some() {
        // Unread bytes and packets travel with the close event.
        return Serviced { active, closed };
    }

    match entry.srrp.as_mut() {
        Some(link) => {
            let bytes = entry.rx.take_all();
            let queued = link.ingest(&bytes, now, settings.parse_timeout, nodes, d);
            for _ in 0..queued {
                events.push_back(Event::Packet(d));
            }
            queue_control(d, &mut entry.tx, link.take_replies());
            if link.sync_due(now, settings.sync_interval) {
                match link.sync_packet(now) {
                    Ok(sync) => queue_control(d, &mut entry.tx, vec![sync]),
                    Err(e) => warn!("[{}] cannot build sync: {}", d, e),
                }
            }
        }
        None if received > 0 => events.push_back(Event::Readable {
            descriptor: d,
            available: entry.rx.len(),
        }),
        None => {}
    }

    // write
    if entry.writable {
        while !entry.tx.is_empty() {
            match entry.channel.transmit(entry.tx.chunk()) {
                Transfer::Bytes(n) => {
                    entry.tx.advance(n);
                    entry.bytes_out += n as u64;
                    active = true;
                    trace!("[{}] sent {} bytes", d, n);
                }
                Transfer::WouldBlock => {
                    entry.writable = false;
                    break;
                }
                Transfer::Closed => {
                    return Serviced {
                        active: true,
                        closed: Some("write failed"),
                    };
                }
            }
        }
    }

    Serviced {
        active,
        closed: None,
    }
}
