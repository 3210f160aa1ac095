//! Daemon configuration, read from flags with `SANDBOXD_*` environment fallbacks.

use clap::Args;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listen port of the daemon.
pub const DEFAULT_PORT: u16 = 2280;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "SANDBOXD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Root directory for session artifacts (defaults to ~/.sandboxd)
    #[arg(long, env = "SANDBOXD_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Shell used for sessions (defaults to bash, falling back to sh)
    #[arg(long, env = "SANDBOXD_SHELL")]
    pub shell: Option<PathBuf>,

    /// Seconds to wait after SIGTERM before SIGKILL when tearing down a session
    #[arg(long, env = "SANDBOXD_TERMINATION_GRACE_PERIOD", default_value = "5")]
    pub termination_grace_period_secs: u64,

    /// Milliseconds between process-tree liveness checks
    #[arg(long, env = "SANDBOXD_TERMINATION_CHECK_INTERVAL", default_value = "100")]
    pub termination_check_interval_ms: u64,

    /// Default timeout for one-shot execution, in seconds
    #[arg(long, env = "SANDBOXD_EXECUTE_TIMEOUT", default_value = "360")]
    pub execute_timeout_secs: u64,
}

impl Config {
    /// Resolved artifact root. Falls back to the system temp dir when no home exists.
    pub fn config_root(&self) -> PathBuf {
        match &self.config_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".sandboxd"),
        }
    }

    pub fn shell_path(&self) -> PathBuf {
        self.shell.clone().unwrap_or_else(default_shell)
    }

    pub fn termination_grace_period(&self) -> Duration {
        Duration::from_secs(self.termination_grace_period_secs)
    }

    pub fn termination_check_interval(&self) -> Duration {
        Duration::from_millis(self.termination_check_interval_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            config_dir: None,
            shell: None,
            termination_grace_period_secs: 5,
            termination_check_interval_ms: 100,
            execute_timeout_secs: 360,
        }
    }
}

fn default_shell() -> PathBuf {
    ["/bin/bash", "/usr/bin/bash"]
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/bin/sh"))
        .to_path_buf()
}
