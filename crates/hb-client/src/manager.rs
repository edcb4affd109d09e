//! Connection manager
//!
//! Owns the socket lifecycle as an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting(i) -> Authorizing -> Authorized
//!                      |                              |
//!                      v (list exhausted)             v (socket closed)
//!                 BackoffWait ----------------> Disconnected
//! ```
//!
//! Candidate ports are probed sequentially, never in parallel; one owned
//! sleep is the only reconnection timer. An authentication rejection is
//! fatal - the host closes the socket and a static token will not get
//! better, so the machine shuts down instead of hammering the handshake.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hb_core::config::BridgeConfig;
use hb_core::error::RequestError;
use hb_core::telemetry::TelemetrySnapshot;
use hb_protocol::{ClientMessage, HostMessage, JsonLineCodec};

use crate::backoff::ExponentialBackoff;
use crate::correlator::RequestCorrelator;

/// How often overdue pending requests are swept
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No socket; a discovery cycle is due
    Disconnected,
    /// Probing candidate port at this index
    Connecting(usize),
    /// Socket open, waiting for the handshake result
    Authorizing,
    /// Handshake accepted; requests flow
    Authorized,
    /// Candidate list exhausted; waiting out the backoff delay
    BackoffWait,
}

/// State pushed by the host and shared with the client handle
#[derive(Default)]
pub struct LinkShared {
    /// Latest working directory pushed by the host
    pub cwd: Mutex<Option<String>>,
    /// Latest unsolicited telemetry snapshot
    pub telemetry: Mutex<Option<TelemetrySnapshot>>,
}

type Wire = Framed<TcpStream, JsonLineCodec<HostMessage>>;
type WireSink = SplitSink<Wire, ClientMessage>;
type WireStream = SplitStream<Wire>;

enum HandshakeOutcome {
    Accepted,
    Rejected,
    Transport(String),
}

enum ServeEnd {
    Shutdown,
    Disconnected(String),
}

/// Drives one logical link to the host agent
pub struct ConnectionManager {
    config: BridgeConfig,
    token: Option<String>,
    correlator: Arc<RequestCorrelator>,
    outbound_rx: mpsc::Receiver<ClientMessage>,
    state_tx: watch::Sender<LinkState>,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
    backoff: ExponentialBackoff,
}

impl ConnectionManager {
    pub fn new(
        config: BridgeConfig,
        token: Option<String>,
        correlator: Arc<RequestCorrelator>,
        outbound_rx: mpsc::Receiver<ClientMessage>,
        state_tx: watch::Sender<LinkState>,
        shared: Arc<LinkShared>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = ExponentialBackoff::from_config(&config.backoff);
        Self {
            config,
            token,
            correlator,
            outbound_rx,
            state_tx,
            shared,
            cancel,
            backoff,
        }
    }

    /// Run the state machine until shutdown or a fatal handshake rejection
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(LinkState::Disconnected);

            let Some(stream) = self.discover().await else {
                if !self.backoff_wait(&mut sweep).await {
                    break;
                }
                continue;
            };

            // A successful open resets both the candidate index (the next
            // discovery starts from the front) and the backoff
            self.backoff.reset();

            let framed = Framed::new(stream, JsonLineCodec::<HostMessage>::new());
            let (mut sink, mut stream): (WireSink, WireStream) = framed.split();

            match self.handshake(&mut sink, &mut stream).await {
                HandshakeOutcome::Accepted => {}
                HandshakeOutcome::Rejected => {
                    tracing::error!("Host rejected the shared token; giving up");
                    break;
                }
                HandshakeOutcome::Transport(reason) => {
                    tracing::warn!("Handshake failed: {}", reason);
                    continue;
                }
            }

            self.set_state(LinkState::Authorized);
            tracing::info!("Bridge link authorized");

            let end = self.serve(&mut sink, &mut stream, &mut sweep).await;

            // Every request still in flight gets a synthetic terminal
            self.correlator.fail_all(RequestError::LinkClosed);

            match end {
                ServeEnd::Shutdown => break,
                ServeEnd::Disconnected(reason) => {
                    tracing::warn!("Bridge link lost: {}; rediscovering", reason);
                }
            }
        }

        self.correlator.close();
        self.set_state(LinkState::Disconnected);
        tracing::debug!("Connection manager stopped");
    }

    /// Probe the candidate list in order; `None` when every port failed
    async fn discover(&mut self) -> Option<TcpStream> {
        for (index, &port) in self.config.candidate_ports.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return None;
            }
            self.set_state(LinkState::Connecting(index));

            let address = self.config.address_for(port);
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address))
                .await
            {
                Ok(Ok(stream)) => {
                    tracing::info!("Connected to host agent at {}", address);
                    return Some(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!("No host agent at {}: {}", address, e);
                }
                Err(_) => {
                    tracing::debug!("Connection to {} timed out", address);
                }
            }
        }
        None
    }

    /// Sit out one backoff delay. Returns `false` on shutdown.
    async fn backoff_wait(&mut self, sweep: &mut Interval) -> bool {
        self.set_state(LinkState::BackoffWait);
        let delay = self.backoff.next_delay();
        tracing::warn!(
            "No host agent on any of {} candidate ports; retrying in {:?}",
            self.config.candidate_ports.len(),
            delay
        );

        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                // Requests issued while the bridge is down still time out
                _ = sweep.tick() => {
                    self.correlator.expire_overdue(std::time::Instant::now());
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// Present the token (when configured) and wait for the verdict
    async fn handshake(&mut self, sink: &mut WireSink, stream: &mut WireStream) -> HandshakeOutcome {
        self.set_state(LinkState::Authorizing);

        if let Some(token) = &self.token {
            let auth = ClientMessage::Auth {
                token: token.clone(),
            };
            if let Err(e) = sink.send(auth).await {
                return HandshakeOutcome::Transport(e.to_string());
            }
        }

        let shared = Arc::clone(&self.shared);
        let verdict = tokio::time::timeout(self.config.connect_timeout, async {
            loop {
                match stream.next().await {
                    Some(Ok(HostMessage::AuthSuccess { .. })) => {
                        return HandshakeOutcome::Accepted
                    }
                    Some(Ok(HostMessage::AuthFail { .. })) => return HandshakeOutcome::Rejected,
                    Some(Ok(push)) => Self::handle_push(&shared, push),
                    Some(Err(e)) => {
                        tracing::warn!("Malformed frame during handshake: {}", e);
                    }
                    None => {
                        return HandshakeOutcome::Transport(
                            "socket closed during handshake".to_string(),
                        )
                    }
                }
            }
        })
        .await;

        match verdict {
            Ok(outcome) => outcome,
            Err(_) => HandshakeOutcome::Transport("handshake timed out".to_string()),
        }
    }

    /// Pump traffic on an authorized link until it drops
    async fn serve(
        &mut self,
        sink: &mut WireSink,
        stream: &mut WireStream,
        sweep: &mut Interval,
    ) -> ServeEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return ServeEnd::Shutdown,

                _ = sweep.tick() => {
                    self.correlator.expire_overdue(std::time::Instant::now());
                }

                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                return ServeEnd::Disconnected(e.to_string());
                            }
                        }
                        // Every client handle dropped; nothing left to serve
                        None => return ServeEnd::Shutdown,
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            if let Some(push) = self.correlator.ingest(msg) {
                                Self::handle_push(&self.shared, push);
                            }
                        }
                        Some(Err(e)) => {
                            // Protocol faults are logged and dropped
                            tracing::warn!("Malformed frame: {}", e);
                        }
                        None => return ServeEnd::Disconnected("socket closed".to_string()),
                    }
                }
            }
        }
    }

    /// Absorb a message that is not part of any correlation
    fn handle_push(shared: &LinkShared, msg: HostMessage) {
        match msg {
            HostMessage::Cwd { content } => {
                if let Ok(mut cwd) = shared.cwd.lock() {
                    *cwd = Some(content);
                }
            }
            HostMessage::Config {
                platform,
                is_admin,
                hostname,
                arch,
                memory,
                ..
            } => {
                if let Ok(mut telemetry) = shared.telemetry.lock() {
                    *telemetry = Some(TelemetrySnapshot {
                        platform,
                        is_admin,
                        hostname,
                        arch,
                        memory_total: memory,
                    });
                }
            }
            other => {
                tracing::debug!("Ignoring push {:?}", other);
            }
        }
    }

    fn set_state(&self, state: LinkState) {
        // send_replace never fails; receivers may be gone during shutdown
        self.state_tx.send_replace(state);
    }
}
