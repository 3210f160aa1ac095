//! Process introspection and signal delivery.

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid as NixPid};
use std::io;
use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, System};

/// OS capability consumed by the terminator: enumerate children, look up
/// process groups, deliver signals.
pub trait ProcessControl: Send + Sync {
    /// Live (non-zombie) direct children of `pid`. Fails if `pid` does not exist.
    fn children(&self, pid: i32) -> io::Result<Vec<i32>>;

    /// Process group id of `pid`, if the process exists.
    fn process_group(&self, pid: i32) -> Option<i32>;

    fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()>;

    fn signal_group(&self, pgid: i32, signal: Signal) -> nix::Result<()>;

    /// Every live descendant of `pid`, each listed before its own descendants.
    /// The tree is re-read from the OS on each call.
    fn descendants(&self, pid: i32) -> Vec<i32> {
        let mut found = Vec::new();
        let mut pending = vec![pid];
        while let Some(parent) = pending.pop() {
            let Ok(children) = self.children(parent) else {
                continue;
            };
            for child in children {
                if !found.contains(&child) {
                    found.push(child);
                    pending.push(child);
                }
            }
        }
        found
    }
}

/// Process table backed by `sysinfo`. Each call takes a fresh snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxProcesses;

/// Zombie or dead entries still occupy the table but run nothing.
fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Threads show up in the table on Linux; only real processes count.
fn is_task(process: &Process) -> bool {
    process.thread_kind().is_some()
}

fn snapshot() -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
}

/// True while `pid` exists and is not a zombie.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let pid = Pid::from_u32(pid as u32);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(is_live).unwrap_or(false)
}

impl ProcessControl for LinuxProcesses {
    fn children(&self, pid: i32) -> io::Result<Vec<i32>> {
        let system = snapshot();
        let root = (pid > 0).then(|| Pid::from_u32(pid as u32));
        let Some(root) = root.filter(|root| system.process(*root).is_some()) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {} not found", pid),
            ));
        };

        let mut children: Vec<i32> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(root))
            .filter(|(_, process)| is_live(process) && !is_task(process))
            .map(|(child, _)| child.as_u32() as i32)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    fn process_group(&self, pid: i32) -> Option<i32> {
        getpgid(Some(NixPid::from_raw(pid))).ok().map(NixPid::as_raw)
    }

    fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
        kill(NixPid::from_raw(pid), signal)
    }

    fn signal_group(&self, pgid: i32, signal: Signal) -> nix::Result<()> {
        killpg(NixPid::from_raw(pgid), signal)
    }
}
