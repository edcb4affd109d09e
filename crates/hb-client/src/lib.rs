//! hb-client: client side of the Hostbridge protocol
//!
//! Owns the socket lifecycle (candidate-port discovery, handshake,
//! reconnection with backoff) and the request correlation layer that matches
//! streamed, chunked replies back to their callers.

pub mod backoff;
pub mod client;
pub mod correlator;
pub mod manager;

pub use backoff::ExponentialBackoff;
pub use client::{BridgeClient, CommandResult};
pub use correlator::{BridgeReply, RequestCorrelator, RequestKind};
pub use manager::LinkState;
