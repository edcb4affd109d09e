//! Shell command execution with streamed output
//!
//! Each `command` request spawns one shell process. Its stdout and stderr
//! are drained concurrently and forwarded as tagged `Output` / `Error`
//! chunks on the connection's outbound channel; process termination emits
//! the terminal `Exit`. Nothing serializes executions - several may stream
//! on one connection at once, interleaving freely on the wire, while the
//! chunks of any single request keep their emission order (one task per
//! execution feeding a FIFO channel).

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use hb_core::error::ExecError;
use hb_protocol::{HostMessage, RequestId};

/// Read buffer size for draining child pipes
const CHUNK_SIZE: usize = 4096;

/// Exit code reported when the real one is unavailable (spawn failure,
/// signal death)
const EXIT_FAILURE: i32 = -1;

/// Spawn a shell running `command` in `working_dir` and stream its output.
///
/// Runs detached; the connection's dispatch loop does not wait for it.
pub fn spawn(
    command: String,
    working_dir: PathBuf,
    request_id: RequestId,
    tx: mpsc::Sender<HostMessage>,
) {
    tokio::spawn(async move {
        run_command(command, working_dir, request_id, tx).await;
    });
}

async fn run_command(
    command: String,
    working_dir: PathBuf,
    request_id: RequestId,
    tx: mpsc::Sender<HostMessage>,
) {
    tracing::debug!(request_id = %request_id, command = %command, "Spawning shell");

    let child = shell_command(&command)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            // Spawn failures are terminal for the request: an error chunk
            // followed by a failure exit so the caller always resolves
            let reason = ExecError::Spawn(e.to_string()).to_string();
            tracing::warn!(request_id = %request_id, "{}", reason);
            let _ = tx
                .send(HostMessage::Error {
                    content: reason,
                    request_id: Some(request_id.clone()),
                })
                .await;
            let _ = tx
                .send(HostMessage::Exit {
                    code: EXIT_FAILURE,
                    request_id,
                })
                .await;
            return;
        }
    };

    let code = stream_child(child, &request_id, &tx).await;

    tracing::debug!(request_id = %request_id, code, "Command finished");
    let _ = tx
        .send(HostMessage::Exit {
            code,
            request_id,
        })
        .await;
}

/// Build the platform shell invocation for a command line
fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("powershell");
        cmd.arg("-NoProfile").arg("-Command").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Drain both pipes until EOF, forwarding chunks, then reap the exit code
async fn stream_child(
    mut child: Child,
    request_id: &RequestId,
    tx: &mpsc::Sender<HostMessage>,
) -> i32 {
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        // Both pipes were requested at spawn; nothing to drain otherwise
        return wait_for_exit(child).await;
    };

    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) => out_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&out_buf[..n]).into_owned();
                    if tx
                        .send(HostMessage::Output {
                            content: chunk,
                            request_id: request_id.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(request_id = %request_id, "stdout closed: {}", e);
                    out_open = false;
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) => err_open = false,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&err_buf[..n]).into_owned();
                    if tx
                        .send(HostMessage::Error {
                            content: chunk,
                            request_id: Some(request_id.clone()),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(request_id = %request_id, "stderr closed: {}", e);
                    err_open = false;
                }
            },
        }
    }

    wait_for_exit(child).await
}

async fn wait_for_exit(mut child: Child) -> i32 {
    match child.wait().await {
        Ok(status) => status.code().unwrap_or(EXIT_FAILURE),
        Err(e) => {
            tracing::warn!("Failed to reap child: {}", e);
            EXIT_FAILURE
        }
    }
}
