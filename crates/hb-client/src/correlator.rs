//! Request correlation
//!
//! Matches streamed, chunked host replies back to their originating callers.
//! Each outbound request registers a pending entry keyed by a fresh request
//! id; inbound chunks accumulate into the entry's buffer until a terminal
//! message fires the caller's resolver, exactly once.
//!
//! Which message is terminal depends on the operation: `exit` ends a
//! command (with `output`/`error` chunks accumulating before it), while
//! `file_content`, `system`, `config`, and operation-failure `error`s end
//! the atomic operations outright.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use hb_core::error::RequestError;
use hb_core::telemetry::TelemetrySnapshot;
use hb_protocol::{HostMessage, RequestId};

/// The operation a pending request was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Command,
    Read,
    Write,
    Config,
}

/// What a resolved request yields
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeReply {
    /// A finished command: ordered concatenation of every streamed chunk,
    /// plus the exit code (0 for builtin successes)
    Command { output: String, exit_code: i32 },
    /// Contents of a read file
    File { content: String },
    /// A generic success status
    System { message: String },
    /// A fresh telemetry snapshot
    Config(TelemetrySnapshot),
}

type Resolver = oneshot::Sender<Result<BridgeReply, RequestError>>;

struct Pending {
    kind: RequestKind,
    buffer: String,
    resolver: Resolver,
    deadline: Instant,
}

/// Issues request ids and resolves their replies
pub struct RequestCorrelator {
    pending: DashMap<RequestId, Pending>,
    counter: AtomicU64,
    request_timeout: Duration,
    /// Set when the owning link shuts down for good; new registrations
    /// fail immediately instead of waiting forever
    closed: AtomicBool,
}

impl RequestCorrelator {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            counter: AtomicU64::new(1),
            request_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Issue a fresh id, unique among requests in flight on this link
    pub fn next_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestId::new(format!("req-{}", n))
    }

    /// Register a pending request and hand back the receiver its terminal
    /// reply will arrive on
    pub fn register(
        &self,
        kind: RequestKind,
    ) -> (RequestId, oneshot::Receiver<Result<BridgeReply, RequestError>>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(RequestError::LinkClosed));
            return (id, rx);
        }

        self.pending.insert(
            id.clone(),
            Pending {
                kind,
                buffer: String::new(),
                resolver: tx,
                deadline: Instant::now() + self.request_timeout,
            },
        );
        (id, rx)
    }

    /// Route one inbound message.
    ///
    /// Returns the message back when it is not part of any correlation -
    /// unsolicited pushes and handshake results - so the link can handle it.
    pub fn ingest(&self, msg: HostMessage) -> Option<HostMessage> {
        let Some(id) = msg.request_id().cloned() else {
            return Some(msg);
        };

        let Some(mut entry) = self.pending.get_mut(&id) else {
            // Already resolved or expired; late chunks are dropped
            tracing::debug!(request_id = %id, "Dropping message for unknown request");
            return None;
        };

        match (entry.kind, msg) {
            // Streamed chunks accumulate in arrival order
            (RequestKind::Command, HostMessage::Output { content, .. }) => {
                entry.buffer.push_str(&content);
            }
            (RequestKind::Command, HostMessage::Error { content, .. }) => {
                entry.buffer.push_str(&content);
            }

            // Terminals for a command
            (RequestKind::Command, HostMessage::Exit { code, .. }) => {
                drop(entry);
                self.resolve(&id, |buffer| {
                    Ok(BridgeReply::Command {
                        output: buffer,
                        exit_code: code,
                    })
                });
            }
            (RequestKind::Command, HostMessage::System { content, .. }) => {
                // Builtin success (cd): no process ran, exit code is zero
                drop(entry);
                self.resolve(&id, |mut buffer| {
                    buffer.push_str(&content);
                    Ok(BridgeReply::Command {
                        output: buffer,
                        exit_code: 0,
                    })
                });
            }

            // Terminals for the atomic operations
            (RequestKind::Read, HostMessage::FileContent { content, .. }) => {
                drop(entry);
                self.resolve(&id, |_| Ok(BridgeReply::File { content }));
            }
            (RequestKind::Write, HostMessage::System { content, .. }) => {
                drop(entry);
                self.resolve(&id, |_| Ok(BridgeReply::System { message: content }));
            }
            (
                RequestKind::Config,
                HostMessage::Config {
                    platform,
                    is_admin,
                    hostname,
                    arch,
                    memory,
                    ..
                },
            ) => {
                drop(entry);
                self.resolve(&id, |_| {
                    Ok(BridgeReply::Config(TelemetrySnapshot {
                        platform,
                        is_admin,
                        hostname,
                        arch,
                        memory_total: memory,
                    }))
                });
            }

            // An error is terminal for everything except command streams
            (_, HostMessage::Error { content, .. }) => {
                drop(entry);
                self.resolve(&id, |_| Err(RequestError::Failed(content)));
            }

            (kind, other) => {
                tracing::warn!(
                    request_id = %id,
                    "Unexpected {:?} reply for {:?} request",
                    other,
                    kind
                );
            }
        }

        None
    }

    /// Fail every pending request whose deadline has passed
    pub fn expire_overdue(&self, now: Instant) {
        let overdue: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for id in overdue {
            tracing::warn!(request_id = %id, "Request timed out");
            self.resolve(&id, |_| Err(RequestError::TimedOut));
        }
    }

    /// Fail every pending request, e.g. when the link closes mid-flight
    pub fn fail_all(&self, error: RequestError) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, |_| Err(error.clone()));
        }
    }

    /// Permanently close: fail everything and refuse new registrations
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fail_all(RequestError::LinkClosed);
    }

    /// Remove the entry and fire its resolver. Removal-before-send makes
    /// resolution idempotent: a second terminal finds no entry.
    fn resolve<F>(&self, id: &RequestId, outcome: F)
    where
        F: FnOnce(String) -> Result<BridgeReply, RequestError>,
    {
        if let Some((_, pending)) = self.pending.remove(id) {
            let result = outcome(pending.buffer);
            if pending.resolver.send(result).is_err() {
                tracing::debug!(request_id = %id, "Caller gone before resolution");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> RequestCorrelator {
        RequestCorrelator::new(Duration::from_secs(60))
    }

    fn output(id: &RequestId, content: &str) -> HostMessage {
        HostMessage::Output {
            content: content.to_string(),
            request_id: id.clone(),
        }
    }

    #[tokio::test]
    async fn test_command_resolves_with_ordered_chunks() {
        let c = correlator();
        let (id, rx) = c.register(RequestKind::Command);

        c.ingest(output(&id, "one "));
        c.ingest(HostMessage::Error {
            content: "warn ".to_string(),
            request_id: Some(id.clone()),
        });
        c.ingest(output(&id, "two"));
        c.ingest(HostMessage::Exit {
            code: 0,
            request_id: id.clone(),
        });

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(
            reply,
            BridgeReply::Command {
                output: "one warn two".to_string(),
                exit_code: 0
            }
        );
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_resolution_is_at_most_once() {
        let c = correlator();
        let (id, rx) = c.register(RequestKind::Command);

        c.ingest(HostMessage::Exit {
            code: 1,
            request_id: id.clone(),
        });
        // A duplicate terminal is dropped, not re-resolved
        c.ingest(HostMessage::Exit {
            code: 2,
            request_id: id.clone(),
        });

        match rx.await.unwrap().unwrap() {
            BridgeReply::Command { exit_code, .. } => assert_eq!(exit_code, 1),
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_keep_separate_buffers() {
        let c = correlator();
        let (id_a, rx_a) = c.register(RequestKind::Command);
        let (id_b, rx_b) = c.register(RequestKind::Command);
        assert_ne!(id_a, id_b);

        c.ingest(output(&id_a, "alpha"));
        c.ingest(output(&id_b, "beta"));
        c.ingest(output(&id_a, "-more"));
        c.ingest(HostMessage::Exit {
            code: 0,
            request_id: id_b.clone(),
        });
        c.ingest(HostMessage::Exit {
            code: 0,
            request_id: id_a.clone(),
        });

        match rx_a.await.unwrap().unwrap() {
            BridgeReply::Command { output, .. } => assert_eq!(output, "alpha-more"),
            other => panic!("Unexpected reply {:?}", other),
        }
        match rx_b.await.unwrap().unwrap() {
            BridgeReply::Command { output, .. } => assert_eq!(output, "beta"),
            other => panic!("Unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_is_terminal_for_read() {
        let c = correlator();
        let (id, rx) = c.register(RequestKind::Read);

        c.ingest(HostMessage::Error {
            content: "Failed to read /x: not found".to_string(),
            request_id: Some(id.clone()),
        });

        assert_eq!(
            rx.await.unwrap(),
            Err(RequestError::Failed(
                "Failed to read /x: not found".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_pushes_are_returned_unconsumed() {
        let c = correlator();
        let push = HostMessage::Cwd {
            content: "/home".to_string(),
        };
        assert_eq!(c.ingest(push.clone()), Some(push));
    }

    #[tokio::test]
    async fn test_expiry_fails_overdue_requests() {
        let c = RequestCorrelator::new(Duration::from_millis(0));
        let (_id, rx) = c.register(RequestKind::Command);

        c.expire_overdue(Instant::now() + Duration::from_millis(1));

        assert_eq!(rx.await.unwrap(), Err(RequestError::TimedOut));
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_new_requests() {
        let c = correlator();
        let (_id, rx) = c.register(RequestKind::Read);

        c.close();
        assert_eq!(rx.await.unwrap(), Err(RequestError::LinkClosed));

        let (_id2, rx2) = c.register(RequestKind::Read);
        assert_eq!(rx2.await.unwrap(), Err(RequestError::LinkClosed));
    }

    #[tokio::test]
    async fn test_late_chunks_for_resolved_request_are_dropped() {
        let c = correlator();
        let (id, rx) = c.register(RequestKind::Command);

        c.ingest(HostMessage::Exit {
            code: 0,
            request_id: id.clone(),
        });
        let _ = rx.await.unwrap();

        // Consumed silently, not returned as a push
        assert_eq!(c.ingest(output(&id, "late")), None);
    }
}
