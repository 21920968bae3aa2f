//! # apix-srrp
//!
//! Wire codec for SRRP, the anchor-addressed packet protocol spoken over apix
//! descriptors.
//!
//! This crate provides:
//! - Binary framing with a start marker, length-prefixed fields and CRC32C trailer
//! - Packet categories (control, request, response, subscribe, unsubscribe, publish)
//! - Payload fragmentation and reassembly
//! - A stream [`Decoder`] that resynchronises after garbage or corrupt frames
//!
//! The codec never touches a transport: it works on byte slices handed to it.

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{next_frame_offset, Decoder};
pub use error::SrrpError;
pub use packet::{parse, serialize, Category, Packet, PacketFlags, FRAME_OVERHEAD, HEADER_SIZE, MAGIC};

/// Protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload carried by a single frame (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum anchor length in bytes.
pub const MAX_ANCHOR_LEN: usize = 1024;

/// Anchor of the control packet used to announce a node id.
pub const CTRL_SYNC: &str = "/sync";

/// Control reply to a peer that announced node id 0.
pub const CTRL_NODEID_ZERO: &str = "/nodeid-zero";

/// Control reply to a peer whose node id is already taken.
pub const CTRL_NODEID_DUP: &str = "/nodeid-dup";
