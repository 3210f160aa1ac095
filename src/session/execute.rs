use super::logs::{self, Stream};
use super::types::{Command, CommandPaths, SessionExecuteRequest, SessionExecuteResponse};
use super::{session_not_found, SessionService, Sessions};
use crate::error::{Error, Result};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_BUF_SIZE: usize = 8192;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Exit code recorded when the shell died before the command finished.
const SHELL_EXITED_CODE: i32 = -1;
/// Exit code recorded when the command's output log could not be opened.
const LOG_UNAVAILABLE_CODE: i32 = -1;

struct CommandPipes {
    stdout: pipe::Receiver,
    stderr: pipe::Receiver,
    input_keepalive: std::fs::File,
}

impl SessionService {
    /// Run a command inside the session shell.
    ///
    /// The command runs in the shell itself, so directory and environment
    /// changes carry over to later commands. Async requests return as soon
    /// as the command is handed to the shell.
    pub async fn execute(
        &self,
        session_id: &str,
        request: SessionExecuteRequest,
    ) -> Result<SessionExecuteResponse> {
        if request.command.trim().is_empty() {
            return Err(Error::BadRequest("command is required".to_string()));
        }

        let command_id = Uuid::new_v4().to_string();
        let (paths, stdin, cancel) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(session_not_found)?;
            if session.shell_exited() {
                return Err(Error::BadRequest("session process has exited".to_string()));
            }
            (
                CommandPaths::new(&session.dir(&self.config_root), &command_id),
                session.stdin.clone(),
                session.cancel.clone(),
            )
        };

        // The registry lock is not held from here on: a shell that is busy
        // with an earlier command may leave this write pending.
        let pipes = prepare_command_dir(&paths)
            .await
            .map_err(|e| Error::Internal(format!("failed to prepare command directory: {}", e)))?;

        let script = wrap_command(&request.command, &paths);
        {
            let mut stdin = stdin.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(session_deleted()),
                written = write_script(&mut stdin, &script) => written.map_err(|e| {
                    Error::BadRequest(format!("failed to write command to session: {}", e))
                })?,
            }
        }

        let completed = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .filter(|_| !cancel.is_cancelled())
                .ok_or_else(session_deleted)?;

            let mut command = Command::new(&command_id, &request.command);
            command.input_keepalive = Some(pipes.input_keepalive);
            session.commands.insert(command_id.clone(), command);

            let (tx, rx) = oneshot::channel();
            let supervisor = Supervisor {
                sessions: self.sessions.clone(),
                session_id: session_id.to_string(),
                command_id: command_id.clone(),
                paths: paths.clone(),
                cancel,
            };
            tokio::spawn(supervisor.run(pipes.stdout, pipes.stderr, tx));
            rx
        };
        info!(session_id, command_id = %command_id, run_async = request.run_async, "executing session command");

        if request.run_async {
            return Ok(SessionExecuteResponse {
                cmd_id: command_id,
                ..Default::default()
            });
        }

        let exit_code = completed.await.map_err(|_| session_deleted())?;

        let log = logs::read_log(&paths.output_log())
            .await
            .map_err(|e| Error::Internal(format!("failed to read command output: {}", e)))?;
        let (stdout, stderr) = logs::demux(&log);

        Ok(SessionExecuteResponse {
            cmd_id: command_id,
            output: Some(lossy(logs::strip_markers(&log))),
            stdout: Some(lossy(stdout)),
            stderr: Some(lossy(stderr)),
            exit_code: Some(exit_code),
        })
    }
}

fn session_deleted() -> Error {
    Error::NotFound("session was deleted before the command completed".to_string())
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn write_script(stdin: &mut tokio::process::ChildStdin, script: &str) -> io::Result<()> {
    stdin.write_all(script.as_bytes()).await?;
    stdin.flush().await
}

/// Create the command directory and its FIFOs and open our ends.
///
/// Output FIFOs are opened read-write so opening never blocks and reads
/// never hit EOF between writers. The input FIFO gets a read-write
/// keep-alive for the same reason.
async fn prepare_command_dir(paths: &CommandPaths) -> io::Result<CommandPipes> {
    tokio::fs::create_dir_all(&paths.dir).await?;
    for fifo in [paths.stdout_pipe(), paths.stderr_pipe(), paths.input_pipe()] {
        mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR)?;
    }

    let stdout = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(paths.stdout_pipe())?;
    let stderr = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(paths.stderr_pipe())?;
    let input_keepalive = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(paths.input_pipe())?;

    Ok(CommandPipes {
        stdout,
        stderr,
        input_keepalive,
    })
}

/// Shell text that runs `command` in the current shell with its stdio bound
/// to the command FIFOs, then records its exit status.
pub(crate) fn wrap_command(command: &str, paths: &CommandPaths) -> String {
    format!(
        "{{\n{command}\n}} < {input} > {stdout} 2> {stderr}; echo $? > {exit}\n",
        command = command,
        input = shell_quote(&paths.input_pipe()),
        stdout = shell_quote(&paths.stdout_pipe()),
        stderr = shell_quote(&paths.stderr_pipe()),
        exit = shell_quote(&paths.exit_code()),
    )
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Copies a running command's output into its log and records completion.
struct Supervisor {
    sessions: Sessions,
    session_id: String,
    command_id: String,
    paths: CommandPaths,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(
        self,
        mut stdout: pipe::Receiver,
        mut stderr: pipe::Receiver,
        completed: oneshot::Sender<i32>,
    ) {
        let mut log = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.output_log())
            .await
        {
            Ok(log) => log,
            Err(e) => {
                warn!(command_id = %self.command_id, error = %e, "failed to open command log");
                self.finish(LOG_UNAVAILABLE_CODE, completed).await;
                return;
            }
        };

        let mut out_buf = vec![0u8; READ_BUF_SIZE];
        let mut err_buf = vec![0u8; READ_BUF_SIZE];
        let (mut out_open, mut err_open) = (true, true);
        let mut ticker = interval(EXIT_CODE_POLL_INTERVAL);

        let exit_code = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(command_id = %self.command_id, "session cancelled, stopping supervisor");
                    return;
                }
                read = stdout.read(&mut out_buf), if out_open => {
                    out_open = append(&mut log, Stream::Stdout, read, &out_buf).await;
                }
                read = stderr.read(&mut err_buf), if err_open => {
                    err_open = append(&mut log, Stream::Stderr, read, &err_buf).await;
                }
                _ = ticker.tick() => {
                    if let Some(code) = read_exit_code(&self.paths.exit_code()).await {
                        break code;
                    }
                    if self.shell_exited().await {
                        warn!(command_id = %self.command_id, "session shell exited before command completed");
                        break SHELL_EXITED_CODE;
                    }
                }
            }
        };

        // Everything the command wrote is already buffered in the FIFOs.
        if out_open {
            drain(&mut log, Stream::Stdout, &mut stdout, &mut out_buf).await;
        }
        if err_open {
            drain(&mut log, Stream::Stderr, &mut stderr, &mut err_buf).await;
        }
        let _ = log.flush().await;
        self.finish(exit_code, completed).await;
    }

    async fn finish(&self, exit_code: i32, completed: oneshot::Sender<i32>) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(command) = sessions
                .get_mut(&self.session_id)
                .and_then(|s| s.commands.get_mut(&self.command_id))
            {
                command.complete(exit_code);
            }
        }
        debug!(command_id = %self.command_id, exit_code, "session command completed");
        let _ = completed.send(exit_code);
    }

    async fn shell_exited(&self) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions
            .get_mut(&self.session_id)
            .map(|s| s.shell_exited())
            .unwrap_or(true)
    }
}

/// Write one framed chunk. Returns whether the stream is still readable.
async fn append(log: &mut File, stream: Stream, read: io::Result<usize>, buf: &[u8]) -> bool {
    match read {
        Ok(0) => false,
        Ok(n) => {
            if let Err(e) = log.write_all(&logs::frame(stream, &buf[..n])).await {
                warn!(error = %e, "failed to append to command log");
            }
            true
        }
        Err(e) => {
            debug!(?stream, error = %e, "command output pipe failed");
            false
        }
    }
}

/// Copy whatever is still buffered in a FIFO. A read that stays pending
/// for `DRAIN_TIMEOUT` means the FIFO is empty.
async fn drain(log: &mut File, stream: Stream, rx: &mut pipe::Receiver, buf: &mut [u8]) {
    while let Ok(Ok(n)) = timeout(DRAIN_TIMEOUT, rx.read(buf)).await {
        if n == 0 {
            break;
        }
        if let Err(e) = log.write_all(&logs::frame(stream, &buf[..n])).await {
            warn!(error = %e, "failed to append to command log");
            break;
        }
    }
}

async fn read_exit_code(path: &Path) -> Option<i32> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    contents.trim().parse().ok()
}
