//! One-shot command execution with a timeout and process-tree cleanup.

use super::termination::{ProcessHandle, Terminator};
use crate::error::{Error, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Used when the caller gives no timeout or a non-positive one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(360);

/// Grace period between SIGTERM and SIGKILL once a command timed out.
pub const TIMEOUT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Timeout in seconds
    #[serde(default)]
    pub timeout: Option<i64>,
}

impl ExecuteRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// -1 when the command could not be started or its status is unknown
    pub exit_code: i32,
    /// Combined stdout and stderr
    pub result: String,
}

impl ExecuteResponse {
    fn failed(result: String) -> Self {
        Self {
            exit_code: -1,
            result,
        }
    }
}

/// Split a command line on spaces. Single and double quotes group words
/// and are stripped; an unterminated quote runs to end of input. Tabs and
/// newlines are ordinary characters.
pub fn parse_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            ('"' | '\'', Some(q)) if q == c => quote = None,
            (' ', None) => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Run `request.command` to completion or until its timeout fires.
///
/// The child leads its own process group. On timeout the tree is terminated
/// with a short grace period and `Error::Timeout` is returned; the partial
/// output is discarded. Dropping the returned future terminates the tree the
/// same way.
pub async fn execute(
    request: ExecuteRequest,
    terminator: &Terminator,
    default_timeout: Duration,
) -> Result<ExecuteResponse> {
    let args = parse_command(&request.command);
    let Some((program, rest)) = args.split_first() else {
        return Err(Error::BadRequest("empty command".to_string()));
    };

    let limit = match request.timeout {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => default_timeout,
    };

    // One pipe shared by stdout and stderr keeps the output interleaved.
    let (output_read, output_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Internal(format!("pipe: {}", e)))?;
    let stderr_write = output_write
        .try_clone()
        .map_err(|e| Error::Internal(format!("pipe: {}", e)))?;

    let spawned = {
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_write))
            .stderr(Stdio::from(stderr_write))
            .process_group(0);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.spawn()
        // `cmd` drops here, closing our copies of the write end.
    };

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            debug!(command = %request.command, error = %e, "failed to start command");
            return Ok(ExecuteResponse::failed(e.to_string()));
        }
    };
    let handle = ProcessHandle::from_child(&child);
    info!(command = %request.command, pid = ?handle.map(|h| h.pid()), ?limit, "executing command");

    // Dropping the request future (client gone) cancels the token, and the
    // reaper then tears the tree down itself.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let (done_tx, done_rx) = oneshot::channel::<(std::io::Result<ExitStatus>, Vec<u8>)>();
    let reaper_cancel = cancel.clone();
    let reaper_terminator = terminator.clone();
    let reaper = tokio::spawn(async move {
        let reader = tokio::task::spawn_blocking(move || read_to_end(output_read));
        let status = tokio::select! {
            status = child.wait() => status,
            _ = reaper_cancel.cancelled() => {
                if let Err(e) = reaper_terminator.terminate(handle, Some(TIMEOUT_GRACE_PERIOD)).await {
                    error!(error = %e, "failed to terminate cancelled command");
                }
                child.wait().await
            }
        };
        let output = reader.await.unwrap_or_default();
        let _ = done_tx.send((status, output));
    });

    tokio::select! {
        _ = sleep(limit) => {
            cancel.cancel();
            // Descendants that escaped the tree may still hold the pipe open.
            let cleanup = TIMEOUT_GRACE_PERIOD * 2 + terminator.check_interval();
            if timeout(cleanup, reaper).await.is_err() {
                debug!(command = %request.command, "output pipe still open after termination");
            }
            Err(Error::Timeout("command execution timeout".to_string()))
        }
        done = done_rx => {
            let response = match done {
                Ok((Ok(status), output)) => ExecuteResponse {
                    // Killed by a signal: no exit code.
                    exit_code: status.code().unwrap_or(-1),
                    result: String::from_utf8_lossy(&output).into_owned(),
                },
                Ok((Err(e), output)) => {
                    debug!(error = %e, "wait failed");
                    ExecuteResponse::failed(String::from_utf8_lossy(&output).into_owned())
                }
                Err(_) => ExecuteResponse::failed(String::new()),
            };
            Ok(response)
        }
    }
}

fn read_to_end(fd: OwnedFd) -> Vec<u8> {
    let mut file = std::fs::File::from(fd);
    let mut output = Vec::new();
    let _ = file.read_to_end(&mut output);
    output
}
