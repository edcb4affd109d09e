//! Bridge integration tests
//!
//! Drives a live host agent over raw JSON lines, the way any bridge client
//! would, and checks the protocol contracts end to end.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hb_host::listener::serve;
use hb_protocol::{ClientMessage, HostMessage, RequestId};

/// Base port for test servers - each test gets a unique offset
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Get a unique port for this test
fn get_test_port() -> u16 {
    let offset = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    39100 + offset
}

/// Start a host agent on a fresh test port
async fn start_host(token: Option<String>) -> (u16, CancellationToken) {
    let port = get_test_port();
    let cancel = CancellationToken::new();
    serve(&[port], token, cancel.clone())
        .await
        .expect("Failed to start host agent");
    (port, cancel)
}

/// Raw line-oriented test client
struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let address = format!("127.0.0.1:{}", port);
        let mut last_err = None;
        for _ in 0..10 {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Self {
                        reader: BufReader::new(reader),
                        writer: BufWriter::new(writer),
                    };
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        panic!("Failed to connect to host at {}: {:?}", address, last_err);
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let mut json = serde_json::to_string(msg).expect("Failed to serialize message");
        json.push('\n');
        self.writer
            .write_all(json.as_bytes())
            .await
            .expect("Failed to write message");
        self.writer.flush().await.expect("Failed to flush");
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("Failed to write raw line");
        self.writer.flush().await.expect("Failed to flush");
    }

    /// Read the next message, panicking after two seconds of silence
    async fn recv(&mut self) -> HostMessage {
        self.try_recv()
            .await
            .expect("Connection closed while expecting a message")
    }

    /// Read the next message; `None` means the host closed the socket
    async fn try_recv(&mut self) -> Option<HostMessage> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a message")
            .expect("Failed to read message");
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).expect("Failed to parse host message"))
    }

    /// Expect the authorization greeting: auth_success, config, cwd.
    /// Returns the pushed working directory.
    async fn expect_greeting(&mut self) -> String {
        assert!(matches!(
            self.recv().await,
            HostMessage::AuthSuccess { .. }
        ));
        match self.recv().await {
            HostMessage::Config {
                platform, memory, ..
            } => {
                assert_eq!(platform, std::env::consts::OS);
                assert!(memory > 0);
            }
            other => panic!("Expected config push, got {:?}", other),
        }
        match self.recv().await {
            HostMessage::Cwd { content } => content,
            other => panic!("Expected cwd push, got {:?}", other),
        }
    }

    /// Collect every message for one request id until its terminal arrives.
    /// Messages for other ids or untagged pushes are returned too, tagged by
    /// arrival order, so callers can assert on interleavings.
    async fn run_command(&mut self, id: &str, content: &str) -> (String, i32) {
        self.send(&ClientMessage::Command {
            content: content.to_string(),
            request_id: RequestId::new(id),
        })
        .await;
        self.collect_command(id).await
    }

    /// Accumulate output/error chunks for `id` until its exit message
    async fn collect_command(&mut self, id: &str) -> (String, i32) {
        let mut buffer = String::new();
        loop {
            match self.recv().await {
                HostMessage::Output {
                    content,
                    request_id,
                } if request_id.as_str() == id => buffer.push_str(&content),
                HostMessage::Error {
                    content,
                    request_id: Some(request_id),
                } if request_id.as_str() == id => buffer.push_str(&content),
                HostMessage::Exit { code, request_id } if request_id.as_str() == id => {
                    return (buffer, code)
                }
                other => panic!("Unexpected message while collecting {}: {:?}", id, other),
            }
        }
    }
}

#[tokio::test]
async fn test_no_token_connect_receives_greeting() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    let cwd = client.expect_greeting().await;
    assert!(!cwd.is_empty());

    cancel.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_streams_output_and_exit() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    let (buffer, code) = client.run_command("r1", "echo hello").await;
    assert_eq!(buffer, "hello\n");
    assert_eq!(code, 0);

    // stderr arrives as error chunks, and the exit code is the shell's
    let (buffer, code) = client.run_command("r2", "echo oops >&2; exit 7").await;
    assert_eq!(buffer, "oops\n");
    assert_eq!(code, 7);

    cancel.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn test_cd_to_missing_directory_is_an_error() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    let original_cwd = client.expect_greeting().await;

    client
        .send(&ClientMessage::Command {
            content: "cd /nonexistent".to_string(),
            request_id: RequestId::new("r1"),
        })
        .await;

    match client.recv().await {
        HostMessage::Error {
            content,
            request_id,
        } => {
            assert_eq!(content, "Directory not found: /nonexistent");
            assert_eq!(request_id, Some(RequestId::new("r1")));
        }
        other => panic!("Expected error, got {:?}", other),
    }

    // The working directory is unchanged
    let (pwd, code) = client.run_command("r2", "pwd").await;
    assert_eq!(code, 0);
    assert_eq!(pwd.trim_end(), original_cwd);

    cancel.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn test_cd_moves_the_working_directory() {
    let (port, cancel) = start_host(None).await;
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().canonicalize().unwrap();

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    client
        .send(&ClientMessage::Command {
            content: format!("cd {}", target.display()),
            request_id: RequestId::new("r1"),
        })
        .await;

    // Unsolicited cwd push first, then the terminal reply
    match client.recv().await {
        HostMessage::Cwd { content } => assert_eq!(content, target.display().to_string()),
        other => panic!("Expected cwd push, got {:?}", other),
    }
    match client.recv().await {
        HostMessage::System { request_id, .. } => {
            assert_eq!(request_id, Some(RequestId::new("r1")))
        }
        other => panic!("Expected system reply, got {:?}", other),
    }

    // Relative paths now resolve against the new directory
    let (pwd, _) = client.run_command("r2", "pwd").await;
    assert_eq!(pwd.trim_end(), target.display().to_string());

    cancel.cancel();
}

#[tokio::test]
async fn test_write_then_read_roundtrip() {
    let (port, cancel) = start_host(None).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("note.txt");
    let body = "line one\nline two\n";

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    client
        .send(&ClientMessage::Write {
            filename: path.display().to_string(),
            content: body.to_string(),
            request_id: RequestId::new("w1"),
        })
        .await;
    match client.recv().await {
        HostMessage::System { request_id, .. } => {
            assert_eq!(request_id, Some(RequestId::new("w1")))
        }
        other => panic!("Expected system reply, got {:?}", other),
    }

    client
        .send(&ClientMessage::Read {
            path: path.display().to_string(),
            request_id: RequestId::new("r1"),
        })
        .await;
    match client.recv().await {
        HostMessage::FileContent {
            content,
            request_id,
        } => {
            assert_eq!(content, body);
            assert_eq!(request_id.as_str(), "r1");
        }
        other => panic!("Expected file content, got {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_read_missing_file_is_a_terminal_error() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    client
        .send(&ClientMessage::Read {
            path: "/no/such/file".to_string(),
            request_id: RequestId::new("r1"),
        })
        .await;
    match client.recv().await {
        HostMessage::Error {
            content,
            request_id,
        } => {
            assert!(content.starts_with("Failed to read"));
            assert_eq!(request_id, Some(RequestId::new("r1")));
        }
        other => panic!("Expected error, got {:?}", other),
    }

    cancel.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_commands_do_not_cross_contaminate() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    // The slow command finishes after the fast one, so their chunks
    // interleave on the wire
    client
        .send(&ClientMessage::Command {
            content: "sleep 0.3; printf slow-marker".to_string(),
            request_id: RequestId::new("slow"),
        })
        .await;
    client
        .send(&ClientMessage::Command {
            content: "printf fast-marker".to_string(),
            request_id: RequestId::new("fast"),
        })
        .await;

    let mut slow_buffer = String::new();
    let mut fast_buffer = String::new();
    let mut slow_done = false;
    let mut fast_done = false;

    while !slow_done || !fast_done {
        match client.recv().await {
            HostMessage::Output {
                content,
                request_id,
            } => match request_id.as_str() {
                "slow" => slow_buffer.push_str(&content),
                "fast" => fast_buffer.push_str(&content),
                other => panic!("Unexpected request id {}", other),
            },
            HostMessage::Exit { request_id, code } => {
                assert_eq!(code, 0);
                match request_id.as_str() {
                    "slow" => slow_done = true,
                    "fast" => fast_done = true,
                    other => panic!("Unexpected request id {}", other),
                }
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    assert_eq!(slow_buffer, "slow-marker");
    assert_eq!(fast_buffer, "fast-marker");

    cancel.cancel();
}

#[tokio::test]
async fn test_wrong_token_fails_and_closes_the_socket() {
    let (port, cancel) = start_host(Some("correct-token".to_string())).await;

    let mut client = TestClient::connect(port).await;
    client
        .send(&ClientMessage::Auth {
            token: "wrong-token".to_string(),
        })
        .await;

    assert!(matches!(client.recv().await, HostMessage::AuthFail { .. }));
    // The host closes the socket; there is no in-band retry
    assert!(client.try_recv().await.is_none());

    cancel.cancel();
}

#[tokio::test]
async fn test_pre_auth_messages_have_no_side_effect() {
    let (port, cancel) = start_host(Some("secret".to_string())).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forbidden.txt");

    let mut client = TestClient::connect(port).await;

    // A write before the handshake must be ignored entirely
    client
        .send(&ClientMessage::Write {
            filename: path.display().to_string(),
            content: "should not exist".to_string(),
            request_id: RequestId::new("w0"),
        })
        .await;

    client
        .send(&ClientMessage::Auth {
            token: "secret".to_string(),
        })
        .await;
    client.expect_greeting().await;

    assert!(!path.exists());

    cancel.cancel();
}

#[tokio::test]
async fn test_malformed_line_does_not_break_the_connection() {
    let (port, cancel) = start_host(None).await;

    let mut client = TestClient::connect(port).await;
    client.expect_greeting().await;

    client.send_raw("this is not json\n").await;

    client
        .send(&ClientMessage::GetConfig {
            request_id: Some(RequestId::new("c1")),
        })
        .await;
    match client.recv().await {
        HostMessage::Config { request_id, .. } => {
            assert_eq!(request_id, Some(RequestId::new("c1")))
        }
        other => panic!("Expected config, got {:?}", other),
    }

    cancel.cancel();
}
