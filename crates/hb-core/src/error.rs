//! Core error types for Hostbridge

use hb_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the hostbridge ecosystem
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Request error
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The host rejected the shared token
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// A single connect attempt failed
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The socket dropped while in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Every candidate port was probed without success
    #[error("Bridge unavailable: no host agent on any of {0} candidate ports")]
    BridgeUnavailable(usize),
}

/// Terminal failures of a single correlated request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The host reported the operation failed
    #[error("{0}")]
    Failed(String),

    /// No terminal message arrived before the request deadline
    #[error("Request timed out")]
    TimedOut,

    /// The connection closed while the request was in flight
    #[error("Connection closed with request in flight")]
    LinkClosed,
}

/// Host-side execution errors
#[derive(Error, Debug)]
pub enum ExecError {
    /// `cd` target missing or not a directory
    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    /// The shell process could not be spawned
    #[error("Failed to spawn shell: {0}")]
    Spawn(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
