//! TCP drivers.

use crate::descriptor::Role;
use crate::driver::{resolve_host_port, Accepted, Channel, Driver, Opened, Transfer};
use crate::error::ApixError;
use crate::{TCP_CLIENT, TCP_SERVER};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, trace};

/// Opens outgoing TCP connections from `host:port` addresses.
#[derive(Debug, Default)]
pub struct TcpClientDriver;

impl Driver for TcpClientDriver {
    fn kind(&self) -> &str {
        TCP_CLIENT
    }

    fn open(&mut self, addr: &str) -> Result<Opened, ApixError> {
        let target = resolve_host_port(addr, false)?;
        let stream = TcpStream::connect(target).map_err(|source| ApixError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay on {} failed: {}", target, e);
        }
        debug!("connecting to {}", target);

        Ok(Opened {
            channel: Box::new(TcpChannel::new(stream)),
            role: Role::Connect,
            peer: target.to_string(),
        })
    }
}

/// Opens TCP listeners on `host:port` addresses (port 0 picks a free port).
#[derive(Debug, Default)]
pub struct TcpServerDriver;

impl Driver for TcpServerDriver {
    fn kind(&self) -> &str {
        TCP_SERVER
    }

    fn open(&mut self, addr: &str) -> Result<Opened, ApixError> {
        let target = resolve_host_port(addr, true)?;
        let listener = TcpListener::bind(target).map_err(|source| ApixError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
        let local = listener.local_addr()?;
        debug!("listening on {}", local);

        Ok(Opened {
            channel: Box::new(TcpListenerChannel {
                listener,
                local,
            }),
            role: Role::Listen,
            peer: local.to_string(),
        })
    }
}

/// A connected (or connecting) TCP stream.
pub struct TcpChannel {
    stream: TcpStream,
    closed: bool,
}

impl TcpChannel {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl Channel for TcpChannel {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Transfer {
        stream_receive(&mut self.stream, buf)
    }

    fn transmit(&mut self, bytes: &[u8]) -> Transfer {
        stream_transmit(&mut self.stream, bytes)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The peer may already be gone.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A listening TCP socket.
pub struct TcpListenerChannel {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpListenerChannel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Channel for TcpListenerChannel {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn receive(&mut self, _buf: &mut [u8]) -> Transfer {
        Transfer::WouldBlock
    }

    fn transmit(&mut self, _bytes: &[u8]) -> Transfer {
        Transfer::WouldBlock
    }

    fn accept(&mut self) -> io::Result<Option<Accepted>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    trace!("set_nodelay on {} failed: {}", peer, e);
                }
                Ok(Some(Accepted {
                    channel: Box::new(TcpChannel::new(stream)),
                    peer: peer.to_string(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Dropping the listener closes the socket.
    fn close(&mut self) {}
}

/// Non-blocking read shared by stream channels.
pub(crate) fn stream_receive<S: Read>(stream: &mut S, buf: &mut [u8]) -> Transfer {
    loop {
        match stream.read(buf) {
            Ok(0) => return Transfer::Closed,
            Ok(n) => return Transfer::Bytes(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read failed: {}", e);
                return Transfer::Closed;
            }
        }
    }
}

/// Non-blocking write shared by stream channels.
pub(crate) fn stream_transmit<S: Write>(stream: &mut S, bytes: &[u8]) -> Transfer {
    if bytes.is_empty() {
        return Transfer::Bytes(0);
    }
    loop {
        match stream.write(bytes) {
            Ok(0) => return Transfer::Closed,
            Ok(n) => return Transfer::Bytes(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("write failed: {}", e);
                return Transfer::Closed;
            }
        }
    }
}
