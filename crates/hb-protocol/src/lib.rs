//! hb-protocol: Wire protocol for the Hostbridge command bridge
//!
//! This crate defines the JSON-line protocol spoken between the host agent
//! and bridge clients over a loopback TCP socket. One UTF-8 JSON object per
//! line, discriminated by a `type` field.

pub mod codec;
pub mod error;
pub mod message;
pub mod request;

pub use codec::{JsonLineCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{ClientMessage, HostMessage};
pub use request::RequestId;
