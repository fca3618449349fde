//! Wire protocol framing and node identity for tapmesh.
//!
//! This crate provides the low-level wire protocol shared by every tapmesh
//! node: the MAC address type that doubles as node identity, the three frame
//! kinds, and the incremental length-prefixed decoder.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 length           | count of bytes that follow |
//! +----------------------+----------------------------+
//! | u8 kind              | 0x00 / 0x80 / 0x81         |
//! +----------------------+----------------------------+
//! | payload              | kind-specific              |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are big-endian. The payload layouts are:
//!
//! - announce (`0x00`): `version:u8 | stamp:i64 | origin_mac:6`
//! - unicast (`0x80`): `dst_mac:6 | src_mac:6 | eth_payload`
//! - broadcast (`0x81`): `stamp:i64 | src_mac:6 | eth_payload`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod mac;

// Re-export main types
pub use error::WireError;
pub use frame::{
    Frame, FrameDecoder, KIND_ANNOUNCE, KIND_BROADCAST, KIND_UNICAST, MAX_FRAME, PROTOCOL_VERSION,
};
pub use mac::{MacAddr, ParseMacError};
