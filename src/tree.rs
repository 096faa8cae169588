//! Graceful-then-forced termination of single processes and whole process trees.
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    constants::PROCESS_CHECK_INTERVAL,
    error::SupervisorError,
    inspector::{KillSignal, ProcessInspector},
};

/// Terminates processes with a bounded graceful window followed by a bounded forced one.
///
/// Every public operation returns within `graceful_timeout + force_timeout` plus the cost
/// of one process-table scan.
#[derive(Clone)]
pub struct ProcessTreeKiller {
    inspector: Arc<dyn ProcessInspector>,
    graceful_timeout: Duration,
    force_timeout: Duration,
    poll_interval: Duration,
}

impl ProcessTreeKiller {
    /// Creates a killer with the given escalation windows.
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        graceful_timeout: Duration,
        force_timeout: Duration,
    ) -> Self {
        Self {
            inspector,
            graceful_timeout,
            force_timeout,
            poll_interval: PROCESS_CHECK_INTERVAL,
        }
    }

    /// Worst-case duration of one termination, excluding enumeration.
    pub fn escalation_bound(&self) -> Duration {
        self.graceful_timeout + self.force_timeout
    }

    /// Terminates `pid` alone: terminate, wait, kill, wait.
    pub fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        self.escalate(&[pid], self.graceful_timeout, self.force_timeout)
    }

    /// Terminates `pid` and every descendant. Children are handled before the root so a
    /// supervising parent cannot respawn them.
    pub fn kill_tree(&self, pid: u32) -> Result<(), SupervisorError> {
        let children = match self.inspector.descendants(pid) {
            Ok(children) => children,
            Err(err) => {
                warn!("Could not enumerate children of PID {pid}: {err}; terminating root only");
                Vec::new()
            }
        };

        if children.is_empty() {
            return self.terminate(pid);
        }

        debug!("Terminating tree of PID {pid}: children {children:?}");
        let half_graceful = self.graceful_timeout / 2;
        let half_force = self.force_timeout / 2;

        let children_result = self.escalate(&children, half_graceful, half_force);
        if let Err(err) = &children_result {
            warn!("Children of PID {pid} survived termination: {err}");
        }

        self.escalate(
            &[pid],
            self.graceful_timeout - half_graceful,
            self.force_timeout - half_force,
        )?;
        children_result
    }

    fn escalate(
        &self,
        pids: &[u32],
        graceful: Duration,
        force: Duration,
    ) -> Result<(), SupervisorError> {
        let targets = self.send(pids, KillSignal::Terminate);
        if targets.is_empty() {
            return Ok(());
        }

        let survivors = self.wait_for_exit(&targets, graceful);
        if survivors.is_empty() {
            return Ok(());
        }

        warn!(
            "PIDs {survivors:?} did not exit within {graceful:?} after terminate; forcing"
        );
        let forced = self.send(&survivors, KillSignal::Kill);
        let stubborn = self.wait_for_exit(&forced, force);

        match stubborn.first() {
            Some(&pid) => Err(SupervisorError::TerminationTimeout { pid }),
            None => Ok(()),
        }
    }

    /// Signals every live pid and returns the ones that were signalled.
    fn send(&self, pids: &[u32], signal: KillSignal) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut signalled = Vec::with_capacity(pids.len());

        for &pid in pids {
            if pid == own_pid || !self.inspector.is_alive(pid) {
                continue;
            }
            // A failed delivery still gets waited on: the next escalation step may work.
            if let Err(err) = self.inspector.signal(pid, signal) {
                warn!("Failed to send {signal:?} to PID {pid}: {err}");
            }
            signalled.push(pid);
        }

        signalled
    }

    /// Polls until every pid is gone or `timeout` elapses; returns the survivors.
    fn wait_for_exit(&self, pids: &[u32], timeout: Duration) -> Vec<u32> {
        let deadline = Instant::now() + timeout;
        let mut alive: Vec<u32> = pids.to_vec();

        loop {
            alive.retain(|pid| self.inspector.is_alive(*pid));
            if alive.is_empty() {
                return alive;
            }

            let now = Instant::now();
            if now >= deadline {
                return alive;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
