//! Process-tree termination: SIGTERM, wait for the tree to drain, SIGKILL.
//!
//! A process group leader is signalled through its group in one call. Any
//! other root has its descendant tree walked and signalled process by
//! process before the root itself. Signalling errors in the graceful phase
//! are logged and ignored; only the forced kill can fail the call.

use super::proc_table::{LinuxProcesses, ProcessControl};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, sleep, Instant};
use tracing::debug;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to kill process {pid}: {source}")]
    Kill { pid: i32, source: nix::Error },
}

/// An OS process id. Non-positive ids never name a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: i32,
}

impl ProcessHandle {
    pub fn new(pid: i32) -> Self {
        Self { pid }
    }

    /// Handle for a spawned child; `None` once the child has been reaped.
    pub fn from_child(child: &tokio::process::Child) -> Option<Self> {
        child.id().map(|pid| Self::new(pid as i32))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_valid(&self) -> bool {
        self.pid > 0
    }

    /// A group leader's process group id equals its own id.
    pub fn is_group_leader(&self, control: &dyn ProcessControl) -> bool {
        control.process_group(self.pid) == Some(self.pid)
    }
}

#[derive(Clone)]
pub struct Terminator {
    control: Arc<dyn ProcessControl>,
    check_interval: Duration,
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminator {
    pub fn new() -> Self {
        Self::with_control(Arc::new(LinuxProcesses))
    }

    pub fn with_control(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            control,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Terminate `root` and all of its descendants.
    ///
    /// Blocks for at most `grace_period` (default 5s) plus one check
    /// interval. A missing or non-positive handle is a no-op.
    pub async fn terminate(
        &self,
        root: Option<ProcessHandle>,
        grace_period: Option<Duration>,
    ) -> Result<(), TerminateError> {
        let Some(root) = root.filter(ProcessHandle::is_valid) else {
            return Ok(());
        };
        let grace_period = grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
        let pid = root.pid();
        let group_leader = root.is_group_leader(self.control.as_ref());

        if group_leader {
            if let Err(e) = self.control.signal_group(pid, Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM to process group failed");
            }
        } else {
            self.signal_tree(pid, Signal::SIGTERM);
            if let Err(e) = self.control.signal(pid, Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }

        if self.wait_for_termination(pid, grace_period).await {
            debug!(pid, "process tree terminated gracefully");
            return Ok(());
        }

        debug!(pid, ?grace_period, "grace period elapsed, sending SIGKILL");
        let result = if group_leader {
            self.control.signal_group(pid, Signal::SIGKILL)
        } else {
            self.signal_tree(pid, Signal::SIGKILL);
            self.control.signal(pid, Signal::SIGKILL)
        };

        match result {
            // Exited between the last check and the kill.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(TerminateError::Kill { pid, source }),
        }
    }

    /// Signal every descendant of `pid`, deepest first. Best effort: a
    /// process that vanished or refused the signal does not stop the walk.
    fn signal_tree(&self, pid: i32, signal: Signal) {
        let children = match self.control.children(pid) {
            Ok(children) => children,
            Err(e) => {
                debug!(pid, error = %e, "could not enumerate children");
                return;
            }
        };

        for &child in &children {
            self.signal_tree(child, signal);
        }

        for &child in &children {
            if let Err(e) = self.control.signal(child, signal) {
                debug!(pid = child, ?signal, error = %e, "signal to descendant failed");
            }
        }
    }

    /// Poll until `pid` has no live children or `timeout` elapses. A process
    /// that is gone, or whose children cannot be read, counts as terminated.
    async fn wait_for_termination(&self, pid: i32, timeout: Duration) -> bool {
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);

        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                _ = ticker.tick() => match self.control.children(pid) {
                    Err(_) => return true,
                    Ok(children) if children.is_empty() => return true,
                    Ok(_) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Children(i32),
        Signal(i32, Signal),
        Group(i32, Signal),
    }

    /// Scripted process table. `tree` maps parent to children; processes in
    /// `cooperative` disappear from the tree once they receive SIGTERM.
    #[derive(Default)]
    struct FakeProcesses {
        tree: Mutex<HashMap<i32, Vec<i32>>>,
        groups: HashMap<i32, i32>,
        cooperative: bool,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeProcesses {
        fn new(tree: &[(i32, &[i32])]) -> Self {
            Self {
                tree: Mutex::new(tree.iter().map(|(p, c)| (*p, c.to_vec())).collect()),
                ..Default::default()
            }
        }

        fn leader(mut self, pid: i32) -> Self {
            self.groups.insert(pid, pid);
            self
        }

        fn cooperative(mut self) -> Self {
            self.cooperative = true;
            self
        }

        fn signals(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| !matches!(c, Call::Children(_)))
                .cloned()
                .collect()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ProcessControl for FakeProcesses {
        fn children(&self, pid: i32) -> io::Result<Vec<i32>> {
            self.record(Call::Children(pid));
            self.tree
                .lock()
                .unwrap()
                .get(&pid)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn process_group(&self, pid: i32) -> Option<i32> {
            Some(*self.groups.get(&pid).unwrap_or(&1))
        }

        fn signal(&self, pid: i32, signal: Signal) -> nix::Result<()> {
            self.record(Call::Signal(pid, signal));
            if self.cooperative && signal == Signal::SIGTERM {
                let mut tree = self.tree.lock().unwrap();
                for children in tree.values_mut() {
                    children.retain(|c| *c != pid);
                }
            }
            Ok(())
        }

        fn signal_group(&self, pgid: i32, signal: Signal) -> nix::Result<()> {
            self.record(Call::Group(pgid, signal));
            if self.cooperative && signal == Signal::SIGTERM {
                self.tree.lock().unwrap().clear();
            }
            Ok(())
        }
    }

    fn terminator(fake: &Arc<FakeProcesses>) -> Terminator {
        Terminator::with_control(fake.clone()).with_check_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn missing_or_non_positive_handle_is_a_no_op() {
        let fake = Arc::new(FakeProcesses::new(&[(10, &[11])]));
        let t = terminator(&fake);

        t.terminate(None, None).await.unwrap();
        t.terminate(Some(ProcessHandle::new(0)), None).await.unwrap();
        t.terminate(Some(ProcessHandle::new(-5)), None).await.unwrap();

        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_leader_is_signalled_once_through_its_group() {
        let fake = Arc::new(FakeProcesses::new(&[(10, &[11, 12]), (11, &[])]).leader(10).cooperative());
        let t = terminator(&fake);

        t.terminate(Some(ProcessHandle::new(10)), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(fake.signals(), vec![Call::Group(10, Signal::SIGTERM)]);
        // No tree walk before the signal: the first enumeration is a poll.
        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0], Call::Group(10, Signal::SIGTERM));
    }

    #[tokio::test]
    async fn non_leader_walks_tree_deepest_first_then_signals_root() {
        let fake = Arc::new(
            FakeProcesses::new(&[(10, &[11, 12]), (11, &[13]), (12, &[]), (13, &[])]).cooperative(),
        );
        let t = terminator(&fake);

        t.terminate(Some(ProcessHandle::new(10)), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(
            fake.signals(),
            vec![
                Call::Signal(13, Signal::SIGTERM),
                Call::Signal(11, Signal::SIGTERM),
                Call::Signal(12, Signal::SIGTERM),
                Call::Signal(10, Signal::SIGTERM),
            ]
        );
    }

    #[tokio::test]
    async fn cooperative_tree_does_not_escalate() {
        let fake = Arc::new(FakeProcesses::new(&[(10, &[11]), (11, &[])]).cooperative());
        let t = terminator(&fake);

        let start = std::time::Instant::now();
        t.terminate(Some(ProcessHandle::new(10)), Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!fake.signals().iter().any(|c| matches!(
            c,
            Call::Signal(_, Signal::SIGKILL) | Call::Group(_, Signal::SIGKILL)
        )));
    }

    #[tokio::test]
    async fn vanished_root_counts_as_terminated() {
        let fake = Arc::new(FakeProcesses::new(&[]));
        let t = terminator(&fake);

        t.terminate(Some(ProcessHandle::new(99)), Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(fake.signals(), vec![Call::Signal(99, Signal::SIGTERM)]);
    }

    #[tokio::test]
    async fn uncooperative_tree_is_killed_after_grace_period() {
        let fake = Arc::new(FakeProcesses::new(&[(10, &[11]), (11, &[])]));
        let t = terminator(&fake);
        let grace = Duration::from_millis(300);

        let start = std::time::Instant::now();
        t.terminate(Some(ProcessHandle::new(10)), Some(grace))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= grace, "returned early: {:?}", elapsed);
        assert!(elapsed < grace + 2 * t.check_interval() + Duration::from_millis(60));
        let kills: Vec<_> = fake
            .signals()
            .into_iter()
            .filter(|c| matches!(c, Call::Signal(_, Signal::SIGKILL)))
            .collect();
        assert_eq!(
            kills,
            vec![Call::Signal(11, Signal::SIGKILL), Call::Signal(10, Signal::SIGKILL)]
        );
    }

    #[tokio::test]
    async fn uncooperative_group_is_killed_through_group() {
        let fake = Arc::new(FakeProcesses::new(&[(10, &[11])]).leader(10));
        let t = terminator(&fake);

        t.terminate(Some(ProcessHandle::new(10)), Some(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(
            fake.signals(),
            vec![
                Call::Group(10, Signal::SIGTERM),
                Call::Group(10, Signal::SIGKILL)
            ]
        );
    }

    #[tokio::test]
    async fn forced_kill_failure_is_reported() {
        struct Stubborn;
        impl ProcessControl for Stubborn {
            fn children(&self, _pid: i32) -> io::Result<Vec<i32>> {
                Ok(vec![2])
            }
            fn process_group(&self, pid: i32) -> Option<i32> {
                Some(pid)
            }
            fn signal(&self, _pid: i32, _signal: Signal) -> nix::Result<()> {
                Err(Errno::EPERM)
            }
            fn signal_group(&self, _pgid: i32, _signal: Signal) -> nix::Result<()> {
                Err(Errno::EPERM)
            }
        }

        let t = Terminator::with_control(Arc::new(Stubborn))
            .with_check_interval(Duration::from_millis(10));
        let err = t
            .terminate(Some(ProcessHandle::new(7)), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, TerminateError::Kill { pid: 7, source: Errno::EPERM }));
    }
}
