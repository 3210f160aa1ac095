//! Shared application state.

use crate::config::Config;
use crate::process::Terminator;
use crate::session::SessionService;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub terminator: Terminator,
    /// Default timeout for one-shot execution
    pub execute_timeout: Duration,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let terminator = Terminator::new().with_check_interval(config.termination_check_interval());
        let sessions = SessionService::new(
            config.config_root(),
            config.shell_path(),
            terminator.clone(),
            config.termination_grace_period(),
        );
        Self {
            sessions: Arc::new(sessions),
            terminator,
            execute_timeout: config.execute_timeout(),
        }
    }
}
