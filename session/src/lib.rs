//! Peer links, mTLS transport, and the mesh controller for tapmesh.
//!
//! This crate ties the mesh together: the transport layer establishes
//! mutually-authenticated TLS streams whose peer identity is a MAC-named
//! certificate, per-link tasks move frames in and out of those streams, and
//! the controller task owns the peer registry, route table, and broadcast
//! dedup, coordinating everything through a single event channel.
//!
//! ## Event flow
//!
//! ```text
//! listener/dialer --LinkReady--> controller --spawn--> link task
//! link task       --FrameRx----> controller --push---> other links
//! link task       --LinkDown---> controller
//! TAP pump        --TapFrame---> controller --inject-> TAP pump
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
mod link;
pub mod registry;
pub mod seed;
pub mod transport;

// Re-export main types
pub use controller::{Connector, ControllerConfig, MeshController, MeshEvent};
pub use registry::{LinkHandle, Peer, PeerRegistry};
pub use seed::{Seed, SeedError};
pub use transport::{
    accept_tls, connect_tcp, connect_tls, dial_seed, listen_tcp, local_mac_from_cert_pem,
    make_client_config, make_server_config, peer_mac_from_cert, IoStream, MacPinVerifier,
};
