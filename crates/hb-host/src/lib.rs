//! hb-host: the Hostbridge host agent
//!
//! Listens on the first free candidate port of the loopback interface and
//! serves bridge connections: shell execution with streamed output, file
//! read/write, default-handler opens, and telemetry snapshots.

pub mod connection;
pub mod exec;
pub mod listener;
pub mod workdir;

pub use listener::HostListener;
