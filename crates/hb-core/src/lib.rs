//! hb-core: Core abstractions and configuration for Hostbridge
//!
//! This crate provides shared configuration, error types, shared-token
//! authentication helpers, and telemetry collection used by the host agent,
//! the client library, and the CLI.

pub mod auth;
pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{BackoffConfig, BridgeConfig};
pub use error::{BridgeError, ConnectionError, ExecError, RequestError};
pub use telemetry::TelemetrySnapshot;
