use super::types::CommandState;
use super::{command_not_found, session_not_found, SessionService};
use crate::error::{Error, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Line-oriented readers such as `read` need a complete line.
pub fn ensure_trailing_newline(data: &str) -> String {
    let mut line = data.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

impl SessionService {
    /// Send `data` to the stdin of a running command.
    ///
    /// The input FIFO is opened for this call only. Opening is non-blocking,
    /// so a command that stopped reading surfaces as a bad request instead
    /// of hanging the caller.
    pub async fn write_input(&self, session_id: &str, command_id: &str, data: &str) -> Result<()> {
        let input_pipe = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(session_not_found)?;

            if session.shell_exited() {
                return Err(Error::BadRequest("session process has exited".to_string()));
            }

            let command = session.commands.get(command_id).ok_or_else(command_not_found)?;
            if let CommandState::Completed { exit_code } = command.state {
                return Err(Error::BadRequest(format!(
                    "command has already completed with exit code {}",
                    exit_code
                )));
            }

            command.paths(&session.dir(&self.config_root)).input_pipe()
        };

        let mut pipe = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&input_pipe)
            .await
            .map_err(|e| Error::BadRequest(format!("failed to open input pipe: {}", e)))?;

        let line = ensure_trailing_newline(data);
        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        }
        .await;
        written.map_err(|e| Error::BadRequest(format!("failed to write to input pipe: {}", e)))?;

        debug!(session_id, command_id, bytes = line.len(), "wrote command input");
        Ok(())
    }
}
