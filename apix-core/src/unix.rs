//! Unix domain socket drivers.

use crate::descriptor::Role;
use crate::driver::{Accepted, Channel, Driver, Opened, Transfer};
use crate::error::ApixError;
use crate::tcp::{stream_receive, stream_transmit};
use crate::{UNIX_CLIENT, UNIX_SERVER};
use mio::event::Source;
use mio::net::{UnixListener, UnixStream};
use mio::Interest;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn socket_path(addr: &str) -> Result<PathBuf, ApixError> {
    if addr.is_empty() {
        return Err(ApixError::AddressInvalid {
            addr: addr.to_string(),
            reason: "empty socket path".to_string(),
        });
    }
    if addr.contains('\0') {
        return Err(ApixError::AddressInvalid {
            addr: addr.to_string(),
            reason: "socket path contains NUL".to_string(),
        });
    }
    Ok(PathBuf::from(addr))
}

/// Connects to Unix domain sockets by path.
#[derive(Debug, Default)]
pub struct UnixClientDriver;

impl Driver for UnixClientDriver {
    fn kind(&self) -> &str {
        UNIX_CLIENT
    }

    fn open(&mut self, addr: &str) -> Result<Opened, ApixError> {
        let path = socket_path(addr)?;
        let stream = UnixStream::connect(&path).map_err(|source| ApixError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
        debug!("connecting to {}", path.display());

        Ok(Opened {
            channel: Box::new(UnixChannel {
                stream,
                closed: false,
            }),
            role: Role::Connect,
            peer: path.display().to_string(),
        })
    }
}

/// Listens on Unix domain socket paths.
///
/// A stale socket file left at the path is replaced; any other kind of file
/// makes the open fail.
#[derive(Debug, Default)]
pub struct UnixServerDriver;

impl Driver for UnixServerDriver {
    fn kind(&self) -> &str {
        UNIX_SERVER
    }

    fn open(&mut self, addr: &str) -> Result<Opened, ApixError> {
        let path = socket_path(addr)?;
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                debug!("removing stale socket {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }
        let listener = UnixListener::bind(&path).map_err(|source| ApixError::ConnectFailed {
            addr: addr.to_string(),
            source,
        })?;
        debug!("listening on {}", path.display());

        Ok(Opened {
            channel: Box::new(UnixListenerChannel {
                listener,
                path: path.clone(),
                closed: false,
            }),
            role: Role::Listen,
            peer: path.display().to_string(),
        })
    }
}

pub struct UnixChannel {
    stream: UnixStream,
    closed: bool,
}

impl Channel for UnixChannel {
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
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct UnixListenerChannel {
    listener: UnixListener,
    path: PathBuf,
    closed: bool,
}

impl UnixListenerChannel {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Channel for UnixListenerChannel {
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
            Ok((stream, _addr)) => Ok(Some(Accepted {
                channel: Box::new(UnixChannel {
                    stream,
                    closed: false,
                }),
                peer: self.path.display().to_string(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}
