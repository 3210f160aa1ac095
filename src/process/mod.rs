//! Process management: OS introspection, process-tree termination and
//! one-shot command execution.

pub mod execute;
pub mod proc_table;
pub mod termination;

pub use execute::{execute, parse_command, ExecuteRequest, ExecuteResponse, DEFAULT_TIMEOUT};
pub use proc_table::{LinuxProcesses, ProcessControl};
pub use termination::{ProcessHandle, TerminateError, Terminator};
