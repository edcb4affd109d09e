//! Per-connection state and message dispatch
//!
//! Each accepted socket gets one handler task owning the connection's whole
//! state - authorization flag and working directory included, so concurrent
//! connections can never observe each other's `cd`. Inbound frames are
//! matched exhaustively; outbound traffic from concurrent executions is
//! funneled through a single mpsc channel so the socket sees whole frames.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hb_core::auth::validate_token;
use hb_core::telemetry::TelemetrySnapshot;
use hb_protocol::{ClientMessage, HostMessage, JsonLineCodec, RequestId};

use crate::{exec, workdir};

/// Capacity of the per-connection outbound channel.
///
/// Holds streamed chunks from concurrent executions while the socket
/// drains; senders back-pressure when the peer reads slowly.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

type Wire = Framed<TcpStream, JsonLineCodec<ClientMessage>>;
type WireSink = SplitSink<Wire, HostMessage>;
type WireStream = SplitStream<Wire>;

/// State owned by a single connection's handler task
struct Connection {
    peer_addr: SocketAddr,
    /// Set once the handshake succeeds (or immediately when no token is
    /// configured); nothing but `Auth` is serviced before that
    authorized: bool,
    /// This connection's working directory; only a successful `cd` moves it
    working_dir: PathBuf,
    /// Shared secret required from the peer, if any
    token: Option<String>,
    outbound_tx: mpsc::Sender<HostMessage>,
}

/// Serve one accepted socket until EOF, error, or shutdown
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    token: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let framed = Framed::new(stream, JsonLineCodec::<ClientMessage>::new());
    let (mut sink, mut stream): (WireSink, WireStream) = framed.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

    let working_dir = std::env::current_dir().context("Failed to read current directory")?;

    let mut conn = Connection {
        peer_addr,
        authorized: token.is_none(),
        working_dir,
        token,
        outbound_tx,
    };

    // Without a configured token the connection is implicitly authorized
    // and greeted straight away
    if conn.authorized {
        sink.send(HostMessage::AuthSuccess { request_id: None })
            .await?;
        send_snapshot(&mut sink, &conn, None).await?;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Connection handler cancelled for {}", conn.peer_addr);
                break;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => sink.send(msg).await?,
                    // Unreachable while this task holds outbound_tx
                    None => break,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        let auth_failed = dispatch(&mut conn, &mut sink, msg).await?;
                        if auth_failed {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // Protocol faults are logged and dropped; the
                        // connection stays usable
                        tracing::warn!("Malformed frame from {}: {}", conn.peer_addr, e);
                    }
                    None => {
                        tracing::debug!("Connection from {} closed", conn.peer_addr);
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Handle one decoded message. Returns `true` when the connection must be
/// torn down (failed handshake).
async fn dispatch(conn: &mut Connection, sink: &mut WireSink, msg: ClientMessage) -> Result<bool> {
    match msg {
        ClientMessage::Auth { token } => return handle_auth(conn, sink, token).await,

        _ if !conn.authorized => {
            tracing::warn!(
                "Dropping message from unauthenticated peer {}",
                conn.peer_addr
            );
        }

        ClientMessage::Command {
            content,
            request_id,
        } => handle_command(conn, content, request_id).await,

        ClientMessage::Read { path, request_id } => {
            let resolved = workdir::resolve(&conn.working_dir, &path);
            let reply = match tokio::fs::read_to_string(&resolved).await {
                Ok(content) => HostMessage::FileContent {
                    content,
                    request_id,
                },
                Err(e) => HostMessage::Error {
                    content: format!("Failed to read {}: {}", resolved.display(), e),
                    request_id: Some(request_id),
                },
            };
            send(conn, reply).await;
        }

        ClientMessage::Write {
            filename,
            content,
            request_id,
        } => {
            let resolved = workdir::resolve(&conn.working_dir, &filename);
            let reply = match write_file(&resolved, &content).await {
                Ok(()) => HostMessage::System {
                    content: format!("Wrote {} bytes to {}", content.len(), resolved.display()),
                    request_id: Some(request_id),
                },
                Err(e) => HostMessage::Error {
                    content: format!("Failed to write {}: {}", resolved.display(), e),
                    request_id: Some(request_id),
                },
            };
            send(conn, reply).await;
        }

        ClientMessage::Open { target } => {
            // Fire-and-forget: no reply on success or failure
            let resolved = if target.contains("://") {
                target
            } else {
                workdir::resolve(&conn.working_dir, &target)
                    .display()
                    .to_string()
            };
            tracing::info!("Opening {} with default handler", resolved);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = open::that(&resolved) {
                    tracing::warn!("Failed to open {}: {}", resolved, e);
                }
            });
        }

        ClientMessage::GetConfig { request_id } => {
            send_snapshot(sink, conn, request_id).await?;
        }
    }

    Ok(false)
}

async fn handle_auth(conn: &mut Connection, sink: &mut WireSink, presented: String) -> Result<bool> {
    if conn.authorized {
        // Token-less hosts already authorized this peer; re-acknowledge
        sink.send(HostMessage::AuthSuccess { request_id: None })
            .await?;
        return Ok(false);
    }

    let expected = conn.token.as_deref().unwrap_or_default();
    if validate_token(&presented, expected) {
        conn.authorized = true;
        tracing::info!("Peer {} authorized", conn.peer_addr);
        sink.send(HostMessage::AuthSuccess { request_id: None })
            .await?;
        send_snapshot(sink, conn, None).await?;
        Ok(false)
    } else {
        tracing::warn!("Authentication failed for {}", conn.peer_addr);
        sink.send(HostMessage::AuthFail { request_id: None })
            .await?;
        // A failed handshake is fatal to this socket; retry means reconnect
        Ok(true)
    }
}

async fn handle_command(conn: &mut Connection, content: String, request_id: RequestId) {
    if let Some(target) = workdir::parse_cd(&content) {
        match workdir::change_dir(&conn.working_dir, target) {
            Ok(new_dir) => {
                conn.working_dir = new_dir;
                let dir_display = conn.working_dir.display().to_string();
                tracing::debug!("Working directory for {} now {}", conn.peer_addr, dir_display);
                // Unsolicited cwd push, then the terminal reply for the request
                send(conn, HostMessage::Cwd { content: dir_display.clone() }).await;
                send(
                    conn,
                    HostMessage::System {
                        content: dir_display,
                        request_id: Some(request_id),
                    },
                )
                .await;
            }
            Err(e) => {
                send(
                    conn,
                    HostMessage::Error {
                        content: e.to_string(),
                        request_id: Some(request_id),
                    },
                )
                .await;
            }
        }
        return;
    }

    exec::spawn(
        content,
        conn.working_dir.clone(),
        request_id,
        conn.outbound_tx.clone(),
    );
}

/// Push a telemetry snapshot and the current working directory
async fn send_snapshot(
    sink: &mut WireSink,
    conn: &Connection,
    request_id: Option<RequestId>,
) -> Result<()> {
    let snapshot = TelemetrySnapshot::collect();
    sink.send(HostMessage::Config {
        platform: snapshot.platform,
        is_admin: snapshot.is_admin,
        hostname: snapshot.hostname,
        arch: snapshot.arch,
        memory: snapshot.memory_total,
        request_id,
    })
    .await?;
    sink.send(HostMessage::Cwd {
        content: conn.working_dir.display().to_string(),
    })
    .await?;
    Ok(())
}

async fn write_file(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

async fn send(conn: &Connection, msg: HostMessage) {
    if conn.outbound_tx.send(msg).await.is_err() {
        tracing::debug!("Outbound channel closed for {}", conn.peer_addr);
    }
}
