//! Session and command types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Command liveness. There is no separate status field: a command without an
/// exit code is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Running,
    Completed { exit_code: i32 },
}

impl CommandState {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandState::Running => None,
            CommandState::Completed { exit_code } => Some(*exit_code),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, CommandState::Running)
    }
}

/// Artifact locations of one command, derived from the session directory
/// and the command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPaths {
    pub dir: PathBuf,
}

impl CommandPaths {
    pub fn new(session_dir: &Path, command_id: &str) -> Self {
        Self {
            dir: session_dir.join(command_id),
        }
    }

    pub fn output_log(&self) -> PathBuf {
        self.dir.join("output.log")
    }

    pub fn exit_code(&self) -> PathBuf {
        self.dir.join("exit_code")
    }

    pub fn input_pipe(&self) -> PathBuf {
        self.dir.join("input.pipe")
    }

    pub fn stdout_pipe(&self) -> PathBuf {
        self.dir.join("stdout.pipe")
    }

    pub fn stderr_pipe(&self) -> PathBuf {
        self.dir.join("stderr.pipe")
    }
}

#[derive(Debug)]
pub struct Command {
    pub id: String,
    pub command: String,
    pub state: CommandState,
    /// Read-write handle on the input FIFO, held while the command runs so
    /// the command never sees EOF between two writes.
    pub(crate) input_keepalive: Option<File>,
}

impl Command {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            state: CommandState::Running,
            input_keepalive: None,
        }
    }

    pub fn paths(&self, session_dir: &Path) -> CommandPaths {
        CommandPaths::new(session_dir, &self.id)
    }

    pub(crate) fn complete(&mut self, exit_code: i32) {
        self.state = CommandState::Completed { exit_code };
        self.input_keepalive = None;
    }

    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            exit_code: self.state.exit_code(),
        }
    }
}

/// A long-lived shell plus the commands run in it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub(crate) shell: Child,
    /// Locked per session so a shell that stops reading blocks only its own
    /// callers.
    pub(crate) stdin: Arc<Mutex<ChildStdin>>,
    pub(crate) commands: HashMap<String, Command>,
    /// Cancelled when the session is deleted; stops command supervisors.
    pub(crate) cancel: CancellationToken,
}

impl Session {
    /// `<configRoot>/sessions/<id>`
    pub fn dir(&self, config_root: &Path) -> PathBuf {
        session_dir(config_root, &self.id)
    }

    /// Whether the shell has exited. Reaps it if so.
    pub(crate) fn shell_exited(&mut self) -> bool {
        !matches!(self.shell.try_wait(), Ok(None))
    }

    pub fn info(&self) -> SessionInfo {
        let mut commands: Vec<CommandInfo> = self.commands.values().map(Command::info).collect();
        commands.sort_by(|a, b| a.id.cmp(&b.id));
        SessionInfo {
            session_id: self.id.clone(),
            commands,
        }
    }
}

pub fn session_dir(config_root: &Path, session_id: &str) -> PathBuf {
    config_root.join("sessions").join(session_id)
}

// Wire types

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub commands: Vec<CommandInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExecuteRequest {
    pub command: String,
    #[serde(default, alias = "async")]
    pub run_async: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExecuteResponse {
    pub cmd_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteInputRequest {
    pub input: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_id() {
        let paths = CommandPaths::new(Path::new("/cfg/sessions/s1"), "c1");
        assert_eq!(paths.output_log(), PathBuf::from("/cfg/sessions/s1/c1/output.log"));
        assert_eq!(paths.exit_code(), PathBuf::from("/cfg/sessions/s1/c1/exit_code"));
        assert_eq!(paths.input_pipe(), PathBuf::from("/cfg/sessions/s1/c1/input.pipe"));
    }

    #[test]
    fn session_dir_layout() {
        assert_eq!(
            session_dir(Path::new("/cfg"), "abc"),
            PathBuf::from("/cfg/sessions/abc")
        );
    }

    #[test]
    fn completing_sets_exit_code_and_drops_keepalive() {
        let mut cmd = Command::new("c1", "true");
        assert!(cmd.state.is_running());
        assert_eq!(cmd.info().exit_code, None);

        cmd.complete(7);
        assert_eq!(cmd.state, CommandState::Completed { exit_code: 7 });
        assert!(cmd.input_keepalive.is_none());
        assert_eq!(cmd.info().exit_code, Some(7));
    }

    #[test]
    fn running_command_omits_exit_code_on_the_wire() {
        let json = serde_json::to_value(Command::new("c1", "sleep 1").info()).unwrap();
        assert_eq!(json, serde_json::json!({"id": "c1", "command": "sleep 1"}));
    }

    #[test]
    fn execute_request_accepts_async_alias() {
        let req: SessionExecuteRequest =
            serde_json::from_str(r#"{"command":"ls","async":true}"#).unwrap();
        assert!(req.run_async);
        let req: SessionExecuteRequest = serde_json::from_str(r#"{"command":"ls"}"#).unwrap();
        assert!(!req.run_async);
    }
}
