//! Sandboxd - host-side process daemon for sandboxes.
//!
//! Runs shell commands on behalf of remote callers, either one-shot with a
//! timeout or inside long-lived shell sessions, and guarantees that every
//! process a command spawns is reclaimed.

#[cfg(not(target_os = "linux"))]
compile_error!("sandboxd only works on Linux.");

pub mod config;
pub mod error;
pub mod http_server;
pub mod log_stream;
pub mod process;
pub mod session;
pub mod state;

pub use error::{Error, Result};
