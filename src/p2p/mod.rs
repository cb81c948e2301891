//! Peer-to-peer message engine.
//!
//! Mutually-authenticated TLS connections between nodes, a typed wire
//! envelope with per-request correlation, anti-entropy catalog sync, and
//! the pending-call table that lets a caller treat a wire exchange as one
//! ordinary invocation.

pub mod connections;
pub mod engine;
pub mod message;
pub mod peer_registry;
pub mod processor;
pub mod service;

/// Timeout for establishing the TCP connection to a peer.
pub const DIAL_TIMEOUT_SECS: u64 = 5;

/// Timeout for completing the TLS handshake once connected.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

pub use connections::ConnectionRegistry;
pub use engine::MessageEngine;
pub use message::{Envelope, MessageType, P2pMessage, P2pResponse};
pub use peer_registry::{Peer, PeerRegistry};
pub use processor::RequestProcessor;
pub use service::P2pService;
