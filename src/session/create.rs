use super::types::Session;
use super::SessionService;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

impl SessionService {
    /// Start a shell for `session_id` and register it.
    ///
    /// Legacy callers get the shell started in their home directory. If the
    /// session directory cannot be created the registration is rolled back
    /// and the shell terminated.
    pub async fn create(&self, session_id: &str, is_legacy: bool) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return Err(Error::Conflict("session already exists".to_string()));
        }

        let cancel = CancellationToken::new();

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        if is_legacy {
            let Some(home) = dirs::home_dir() else {
                cancel.cancel();
                return Err(Error::Internal(
                    "failed to obtain user home directory while checking SDK version".to_string(),
                ));
            };
            cmd.current_dir(&home);
        }

        let mut shell = cmd.spawn().map_err(|e| {
            cancel.cancel();
            Error::Internal(format!("failed to start session shell: {}", e))
        })?;
        let Some(stdin) = shell.stdin.take() else {
            cancel.cancel();
            return Err(Error::Internal("session shell has no stdin".to_string()));
        };

        let session = Session {
            id: session_id.to_string(),
            shell,
            stdin: Arc::new(Mutex::new(stdin)),
            commands: HashMap::new(),
            cancel,
        };
        let dir = session.dir(&self.config_root);
        sessions.insert(session_id.to_string(), session);

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(session_id, dir = %dir.display(), error = %e, "failed to create session directory, rolling back");
            let session = sessions.remove(session_id);
            drop(sessions);
            if let Some(session) = session {
                self.dispose(session).await;
            }
            return Err(Error::Internal(format!(
                "failed to create session directory: {}",
                e
            )));
        }

        info!(session_id, shell = %self.shell.display(), legacy = is_legacy, "created session");
        Ok(())
    }
}
