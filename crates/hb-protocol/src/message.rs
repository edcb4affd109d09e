//! Message types for the Hostbridge protocol
//!
//! Messages are serialized as single-line JSON objects with a `type`
//! discriminant (snake_case) and camelCase field names, framed by the codec
//! in `codec.rs`.
//!
//! # Message Flow
//!
//! Typical sequence for one connection:
//!
//! 1. Client connects; if the host has a shared token configured the client
//!    sends `Auth` and waits for `AuthSuccess` / `AuthFail`
//! 2. On authorization the host pushes a `Config` snapshot and a `Cwd` update
//! 3. Client issues `Command` / `Read` / `Write` / `GetConfig` requests, each
//!    tagged with a fresh request id
//! 4. The host streams `Output` / `Error` chunks and closes each request with
//!    a terminal message (`Exit`, `FileContent`, `System`, or a terminal
//!    `Error`)
//!
//! `Open` is fire-and-forget and never produces a reply.

use serde::{Deserialize, Serialize};

use crate::request::RequestId;

/// Messages sent from a bridge client to the host agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Present the shared secret for this host
    Auth {
        /// Opaque token, compared against the host's configured secret
        token: String,
    },

    /// Execute a shell command, or the builtin `cd`
    Command {
        /// The command line, passed verbatim to the host shell
        content: String,
        request_id: RequestId,
    },

    /// Read a file's full contents
    Read {
        /// Path, resolved against the connection's working directory
        path: String,
        request_id: RequestId,
    },

    /// Write (create or replace) a file, creating missing parents
    Write {
        filename: String,
        content: String,
        request_id: RequestId,
    },

    /// Open a path or URL with the host's default handler. No reply.
    Open { target: String },

    /// Request a fresh telemetry snapshot
    GetConfig {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

/// Messages sent from the host agent to a bridge client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    /// Handshake accepted; the connection is authorized
    AuthSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    /// Handshake rejected; the host closes the socket after sending this
    AuthFail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    /// Telemetry snapshot, pushed after authorization or on `GetConfig`
    Config {
        /// Operating system name (e.g. "linux", "macos", "windows")
        platform: String,
        /// Whether the agent process runs with elevated privileges
        is_admin: bool,
        hostname: String,
        /// CPU architecture (e.g. "x86_64", "aarch64")
        arch: String,
        /// Total physical memory in bytes
        memory: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    /// Current working directory of the connection
    Cwd { content: String },

    /// A chunk of stdout from a running command
    Output {
        content: String,
        request_id: RequestId,
    },

    /// A chunk of stderr from a running command, or an operation failure.
    /// Carries a request id when tied to a specific request.
    Error {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    /// Terminal: the spawned process finished
    Exit { code: i32, request_id: RequestId },

    /// Terminal: result of a `Read` request
    FileContent {
        content: String,
        request_id: RequestId,
    },

    /// Terminal: generic success/status
    System {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

impl HostMessage {
    /// The request id this message answers, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            HostMessage::AuthSuccess { request_id }
            | HostMessage::AuthFail { request_id }
            | HostMessage::Config { request_id, .. }
            | HostMessage::Error { request_id, .. }
            | HostMessage::System { request_id, .. } => request_id.as_ref(),
            HostMessage::Output { request_id, .. }
            | HostMessage::Exit { request_id, .. }
            | HostMessage::FileContent { request_id, .. } => Some(request_id),
            HostMessage::Cwd { .. } => None,
        }
    }
}
