//! Candidate-port listener
//!
//! The host agent and its clients share an ordered candidate-port list. The
//! agent binds the first free one; clients probe the same list in the same
//! order until they find it.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::connection;

/// Accepts bridge connections on the loopback interface
pub struct HostListener {
    listener: TcpListener,
    port: u16,
    /// Shared secret each connection must present; `None` authorizes every
    /// loopback peer implicitly
    token: Option<String>,
    cancel: CancellationToken,
}

impl HostListener {
    /// Bind the first free port of the candidate list.
    ///
    /// Exhausting the list is a startup failure: the caller is expected to
    /// treat the error as fatal.
    pub async fn bind(
        candidate_ports: &[u16],
        token: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        for &port in candidate_ports {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    let port = listener
                        .local_addr()
                        .context("Failed to read bound address")?
                        .port();
                    tracing::info!("Host agent listening on 127.0.0.1:{}", port);
                    return Ok(Self {
                        listener,
                        port,
                        token,
                        cancel,
                    });
                }
                Err(e) => {
                    tracing::warn!("Candidate port {} unavailable: {}", port, e);
                }
            }
        }

        bail!(
            "All {} candidate ports are in use; cannot start host agent",
            candidate_ports.len()
        );
    }

    /// The port actually bound
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the accept loop until cancelled
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Host agent shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Install a handler task for a new connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Loopback trust boundary: nothing routed from elsewhere is served
        if !peer_addr.ip().is_loopback() {
            tracing::warn!("Rejected non-loopback connection from {}", peer_addr);
            return;
        }

        tracing::info!("New connection from {}", peer_addr);

        let token = self.token.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            match connection::handle_connection(socket, peer_addr, token, cancel).await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Convenience for tests and embedders: bind and serve in one task
pub async fn serve(
    candidate_ports: &[u16],
    token: Option<String>,
    cancel: CancellationToken,
) -> Result<u16> {
    let listener = HostListener::bind(candidate_ports, token, cancel).await?;
    let port = listener.port();
    tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            tracing::error!("Listener failed: {}", e);
        }
    });
    Ok(port)
}
