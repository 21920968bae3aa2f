//! # apix-core
//!
//! Single-threaded, cooperative I/O runtime.
//!
//! This crate provides:
//! - Per-descriptor read buffers and write queues
//! - A descriptor table handing out opaque integer handles
//! - Pluggable transport drivers (TCP and Unix sockets included)
//! - The [`Context`] poll loop that moves bytes between transports and buffers
//! - An optional SRRP mode that turns a descriptor's byte stream into packets
//!
//! ```no_run
//! use apix_core::Context;
//! use apix_srrp::Packet;
//!
//! # fn main() -> Result<(), apix_core::ApixError> {
//! let mut ctx = Context::new()?;
//! ctx.enable_posix()?;
//! let fd = ctx.open_tcp_client("127.0.0.1:8080")?;
//!
//! let pac = Packet::ctrl(0x1111, "/sync", "")?;
//! ctx.send(fd, pac.raw())?;
//!
//! let mut buf = [0u8; 256];
//! loop {
//!     ctx.poll(10)?;
//!     let n = ctx.read_from_buffer(fd, &mut buf)?;
//!     if n > 0 {
//!         match apix_srrp::parse(&buf[..n]) {
//!             Ok(Some((pac, _))) => println!("recv srrp: {:?}", pac.anchor()),
//!             _ => println!("recv raw: {}", String::from_utf8_lossy(&buf[..n])),
//!         }
//!     }
//! }
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod event;
pub mod srrp;
pub mod tcp;
#[cfg(unix)]
pub mod unix;

pub use buffer::ByteQueue;
pub use config::{BufferConfig, Config, ConfigError, NetworkConfig, PollConfig, SrrpConfig};
pub use context::{Context, Interrupter};
pub use descriptor::{Descriptor, DescriptorInfo, DescriptorTable, Role};
pub use driver::{Accepted, Channel, Driver, DriverRegistry, Opened, Transfer};
pub use error::ApixError;
pub use event::Event;
pub use srrp::{NodeDirectory, SrrpLink};

/// Transport kind of the TCP client driver.
pub const TCP_CLIENT: &str = "tcp_client";

/// Transport kind of the TCP listening driver.
pub const TCP_SERVER: &str = "tcp_server";

/// Transport kind of the Unix domain socket client driver.
pub const UNIX_CLIENT: &str = "unix_client";

/// Transport kind of the Unix domain socket listening driver.
pub const UNIX_SERVER: &str = "unix_server";
