//! High-level bridge client
//!
//! Wraps the connection manager and correlator behind typed request
//! methods. The handle is cheap to clone; all clones share one link.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use hb_core::config::BridgeConfig;
use hb_core::error::{BridgeError, ConnectionError, RequestError};
use hb_core::telemetry::TelemetrySnapshot;
use hb_protocol::ClientMessage;

use crate::correlator::{BridgeReply, RequestCorrelator, RequestKind};
use crate::manager::{ConnectionManager, LinkShared, LinkState};

/// Capacity of the outbound request channel; sends queue here while the
/// link is rediscovering the host
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Result of an executed command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Ordered concatenation of every streamed stdout/stderr chunk
    pub output: String,
    /// The process exit code (0 for builtin successes)
    pub exit_code: i32,
}

/// Handle to a bridge link
#[derive(Clone)]
pub struct BridgeClient {
    correlator: Arc<RequestCorrelator>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    state_rx: watch::Receiver<LinkState>,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
    candidate_count: usize,
}

impl BridgeClient {
    /// Spawn a connection manager and return its handle.
    ///
    /// The manager starts discovering immediately and keeps reconnecting
    /// until `shutdown` (or a fatal handshake rejection).
    pub fn connect(config: BridgeConfig, token: Option<String>) -> Self {
        let candidate_count = config.candidate_ports.len();
        let correlator = Arc::new(RequestCorrelator::new(config.request_timeout));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let shared = Arc::new(LinkShared::default());
        let cancel = CancellationToken::new();

        let manager = ConnectionManager::new(
            config,
            token,
            Arc::clone(&correlator),
            outbound_rx,
            state_tx,
            Arc::clone(&shared),
            cancel.clone(),
        );
        tokio::spawn(manager.run());

        Self {
            correlator,
            outbound_tx,
            state_rx,
            shared,
            cancel,
            candidate_count,
        }
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Wait until the link is authorized, or give up after `deadline`
    pub async fn wait_authorized(&self, deadline: Duration) -> Result<(), BridgeError> {
        let mut rx = self.state_rx.clone();
        let wait = rx.wait_for(|state| *state == LinkState::Authorized);
        let result = match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::ConnectionLost(
                "connection manager stopped".to_string(),
            )
            .into()),
            Err(_) => Err(ConnectionError::BridgeUnavailable(self.candidate_count).into()),
        };
        result
    }

    /// Execute a shell command (or builtin `cd`) on the host
    pub async fn execute(&self, command: &str) -> Result<CommandResult, BridgeError> {
        let reply = self
            .request(RequestKind::Command, |request_id| ClientMessage::Command {
                content: command.to_string(),
                request_id,
            })
            .await?;

        match reply {
            BridgeReply::Command { output, exit_code } => Ok(CommandResult { output, exit_code }),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Read a file's full contents from the host
    pub async fn read_file(&self, path: &str) -> Result<String, BridgeError> {
        let reply = self
            .request(RequestKind::Read, |request_id| ClientMessage::Read {
                path: path.to_string(),
                request_id,
            })
            .await?;

        match reply {
            BridgeReply::File { content } => Ok(content),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Write a file on the host, creating missing parent directories.
    /// Returns the host's status line.
    pub async fn write_file(&self, filename: &str, content: &str) -> Result<String, BridgeError> {
        let reply = self
            .request(RequestKind::Write, |request_id| ClientMessage::Write {
                filename: filename.to_string(),
                content: content.to_string(),
                request_id,
            })
            .await?;

        match reply {
            BridgeReply::System { message } => Ok(message),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Open a path or URL with the host's default handler. Fire-and-forget:
    /// success only means the request was handed to the link.
    pub async fn open(&self, target: &str) -> Result<(), BridgeError> {
        self.send(ClientMessage::Open {
            target: target.to_string(),
        })
        .await
    }

    /// Request a fresh telemetry snapshot from the host
    pub async fn get_config(&self) -> Result<TelemetrySnapshot, BridgeError> {
        let reply = self
            .request(RequestKind::Config, |request_id| ClientMessage::GetConfig {
                request_id: Some(request_id),
            })
            .await?;

        match reply {
            BridgeReply::Config(snapshot) => Ok(snapshot),
            other => Err(unexpected_reply(other)),
        }
    }

    /// The working directory last pushed by the host, if any
    pub fn current_cwd(&self) -> Option<String> {
        self.shared.cwd.lock().ok().and_then(|cwd| cwd.clone())
    }

    /// The telemetry snapshot last pushed by the host, if any
    pub fn telemetry(&self) -> Option<TelemetrySnapshot> {
        self.shared
            .telemetry
            .lock()
            .ok()
            .and_then(|snapshot| snapshot.clone())
    }

    /// Number of requests currently awaiting their terminal message
    pub fn in_flight(&self) -> usize {
        self.correlator.in_flight()
    }

    /// Tear the link down; every pending request resolves with a
    /// closed-link error
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request(
        &self,
        kind: RequestKind,
        make_message: impl FnOnce(hb_protocol::RequestId) -> ClientMessage,
    ) -> Result<BridgeReply, BridgeError> {
        let (id, rx) = self.correlator.register(kind);
        self.send(make_message(id)).await?;

        match rx.await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(_) => Err(ConnectionError::ConnectionLost(
                "connection manager stopped".to_string(),
            )
            .into()),
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), BridgeError> {
        self.outbound_tx.send(msg).await.map_err(|_| {
            BridgeError::from(ConnectionError::ConnectionLost(
                "connection manager stopped".to_string(),
            ))
        })
    }
}

fn unexpected_reply(reply: BridgeReply) -> BridgeError {
    RequestError::Failed(format!("Unexpected reply: {:?}", reply)).into()
}
