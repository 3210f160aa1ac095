//! In-memory session registry.
//!
//! Every session owns a shell process and a directory of per-command
//! artifacts under `<configRoot>/sessions/<sessionId>/`. All access to the
//! id -> session map goes through [`SessionService`] and a single lock.

mod create;
mod execute;
mod input;
pub mod logs;
pub mod types;

pub use input::ensure_trailing_newline;
pub use types::{
    Command, CommandInfo, CommandPaths, CommandState, CreateSessionRequest, Session,
    SessionExecuteRequest, SessionExecuteResponse, SessionInfo, WriteInputRequest,
};

use crate::error::{Error, Result};
use crate::process::{ProcessHandle, Terminator};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Thread-safe session storage.
pub type Sessions = Arc<Mutex<HashMap<String, Session>>>;

pub struct SessionService {
    config_root: PathBuf,
    shell: PathBuf,
    sessions: Sessions,
    terminator: Terminator,
    grace_period: Duration,
}

impl SessionService {
    pub fn new(
        config_root: impl Into<PathBuf>,
        shell: impl Into<PathBuf>,
        terminator: Terminator,
        grace_period: Duration,
    ) -> Self {
        Self {
            config_root: config_root.into(),
            shell: shell.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            terminator,
            grace_period,
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        types::session_dir(&self.config_root, session_id)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<SessionInfo> = sessions.values().map(Session::info).collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(Session::info)
            .ok_or_else(session_not_found)
    }

    pub async fn get_command(&self, session_id: &str, command_id: &str) -> Result<CommandInfo> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id).ok_or_else(session_not_found)?;
        session
            .commands
            .get(command_id)
            .map(Command::info)
            .ok_or_else(command_not_found)
    }

    /// Current state of a command; `None` if the session or command is unknown.
    pub async fn command_state(&self, session_id: &str, command_id: &str) -> Option<CommandState> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)?
            .commands
            .get(command_id)
            .map(|c| c.state)
    }

    /// Artifact paths for a command. The session must exist; the command
    /// need not, so logs of a command that has not started read as empty.
    pub async fn command_paths(&self, session_id: &str, command_id: &str) -> Result<CommandPaths> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(session_id).ok_or_else(session_not_found)?;
        Ok(CommandPaths::new(&session.dir(&self.config_root), command_id))
    }

    /// Pid of the session shell, while it runs.
    pub async fn shell_pid(&self, session_id: &str) -> Option<i32> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .and_then(|s| ProcessHandle::from_child(&s.shell))
            .map(|h| h.pid())
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(session_not_found)?;
        let dir = session.dir(&self.config_root);

        self.dispose(session).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(session_id, dir = %dir.display(), error = %e, "failed to remove session directory");
        }
        info!(session_id, "deleted session");
        Ok(())
    }

    /// Delete every session. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            let session_id = session.id.clone();
            let dir = session.dir(&self.config_root);
            self.dispose(session).await;
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(session_id = %session_id, dir = %dir.display(), error = %e, "failed to remove session directory");
            }
        }
    }

    /// Stop a session that is no longer registered: cancel its supervisors,
    /// terminate the shell tree and reap the shell.
    async fn dispose(&self, session: Session) {
        let Session {
            id,
            mut shell,
            stdin,
            cancel,
            ..
        } = session;

        cancel.cancel();
        drop(stdin);

        let handle = ProcessHandle::from_child(&shell);
        if let Err(e) = self.terminator.terminate(handle, Some(self.grace_period)).await {
            warn!(session_id = %id, error = %e, "failed to terminate session shell");
        }
        let _ = shell.start_kill();
        match shell.wait().await {
            Ok(status) => debug!(session_id = %id, ?status, "session shell reaped"),
            Err(e) => debug!(session_id = %id, error = %e, "failed to reap session shell"),
        }
    }
}

fn session_not_found() -> Error {
    Error::NotFound("session not found".to_string())
}

fn command_not_found() -> Error {
    Error::NotFound("command not found".to_string())
}
