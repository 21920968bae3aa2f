//! Transport driver abstraction.
//!
//! A [`Driver`] opens transport instances of one kind; each open instance is a
//! [`Channel`] the poll loop reads from and writes to. Drivers are registered
//! by kind tag in a [`DriverRegistry`], so the loop never needs to know which
//! transports exist.

use crate::descriptor::Role;
use crate::error::ApixError;
use mio::event::Source;
use mio::Interest;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Outcome of a single non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes moved.
    Bytes(usize),
    /// The transport cannot make progress right now.
    WouldBlock,
    /// The transport is gone.
    Closed,
}

/// One open transport instance.
pub trait Channel: Send {
    /// The readiness source registered with the poll loop.
    fn source(&mut self) -> &mut dyn Source;

    fn interest(&self) -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }

    /// Checks whether a pending connection attempt has completed.
    ///
    /// Returns `Ok(false)` while still in progress and an error if the
    /// attempt failed.
    fn finish_connect(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Pulls bytes from the transport into `buf`.
    fn receive(&mut self, buf: &mut [u8]) -> Transfer;

    /// Pushes bytes to the transport.
    fn transmit(&mut self, bytes: &[u8]) -> Transfer;

    /// Accepts one pending connection on a listening channel.
    fn accept(&mut self) -> io::Result<Option<Accepted>> {
        Ok(None)
    }

    /// Releases transport resources. Must be idempotent.
    fn close(&mut self);
}

/// A freshly opened channel, as returned by [`Driver::open`].
pub struct Opened {
    pub channel: Box<dyn Channel>,
    pub role: Role,
    pub peer: String,
}

/// A connection taken off a listening channel.
pub struct Accepted {
    pub channel: Box<dyn Channel>,
    pub peer: String,
}

/// Opens channels of one transport kind.
pub trait Driver: Send {
    /// Kind tag under which the driver is registered.
    fn kind(&self) -> &str;

    /// Opens a channel to (or on) `addr` without blocking.
    fn open(&mut self, addr: &str) -> Result<Opened, ApixError>;
}

/// Enabled drivers, keyed by kind tag.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, driver: Box<dyn Driver>) -> Result<(), ApixError> {
        let kind = driver.kind().to_string();
        if self.drivers.contains_key(&kind) {
            return Err(ApixError::TransportExists(kind));
        }
        self.drivers.insert(kind, driver);
        Ok(())
    }

    pub fn disable(&mut self, kind: &str) -> Result<Box<dyn Driver>, ApixError> {
        self.drivers
            .remove(kind)
            .ok_or_else(|| ApixError::UnknownTransport(kind.to_string()))
    }

    pub fn is_enabled(&self, kind: &str) -> bool {
        self.drivers.contains_key(kind)
    }

    pub fn get_mut(&mut self, kind: &str) -> Result<&mut dyn Driver, ApixError> {
        match self.drivers.get_mut(kind) {
            Some(driver) => Ok(driver.as_mut()),
            None => Err(ApixError::UnknownTransport(kind.to_string())),
        }
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.drivers.clear();
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.drivers.keys()).finish()
    }
}

/// Resolves a `host:port` address.
///
/// The port must be numeric; port 0 is only accepted when `allow_any_port`
/// is set (listeners binding an ephemeral port).
pub fn resolve_host_port(addr: &str, allow_any_port: bool) -> Result<SocketAddr, ApixError> {
    let invalid = |reason: &str| ApixError::AddressInvalid {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if !addr.is_ascii() {
        return Err(invalid("address must be ASCII"));
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected <host>:<port>"))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("port must be numeric"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| invalid("port must be in 1-65535"))?;
    if port == 0 && !allow_any_port {
        return Err(invalid("port must be in 1-65535"));
    }

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&format!("cannot resolve host: {}", e)))?;
    addrs
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses"))
}
