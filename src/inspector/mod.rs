//! Platform process introspection behind one interface.
//!
//! Every OS-specific question the supervisor and the watchdog ask (who listens on a port,
//! what is this process's command line, which processes descend from it, is it still
//! alive) goes through [`ProcessInspector`]. The implementation is chosen once by
//! [`default_inspector`].
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

use crate::error::SupervisorError;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixInspector;
#[cfg(windows)]
pub use windows::WindowsInspector;

/// Escalation level of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillSignal {
    /// Ask the process to exit (SIGTERM, `taskkill`).
    Terminate,
    /// Force the process to exit (SIGKILL, `taskkill /F`).
    Kill,
}

/// CPU and memory figures for one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// CPU usage since the previous sample, in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// OS introspection and signalling capability.
pub trait ProcessInspector: Send + Sync {
    /// Pid of the process listening on `port`, never the current process.
    fn listener_pid(&self, port: u16) -> Result<Option<u32>, SupervisorError>;

    /// Space-joined command line of `pid`, if it can be read.
    fn command_line(&self, pid: u32) -> Option<String>;

    /// All transitive children of `pid`, parents before their children. Never contains the
    /// current process.
    fn descendants(&self, pid: u32) -> Result<Vec<u32>, SupervisorError>;

    /// Whether `pid` still runs. Zombies count as dead.
    fn is_alive(&self, pid: u32) -> bool;

    /// Delivers a termination request. A process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), SupervisorError>;

    /// Current resource usage of `pid`.
    fn resource_usage(&self, pid: u32) -> Option<ResourceUsage>;
}

/// Returns the inspector for the platform this binary was built for.
pub fn default_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(unix)]
    {
        Arc::new(UnixInspector::new())
    }

    #[cfg(windows)]
    {
        Arc::new(WindowsInspector::new())
    }
}

/// Process table snapshotting shared by the platform inspectors.
///
/// The `System` is kept between calls so CPU usage is measured against the previous
/// sample of the same process.
pub(crate) struct ProcessTable {
    system: Mutex<System>,
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> std::sync::MutexGuard<'_, System> {
        self.system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh_one(system: &mut System, pid: u32) -> Pid {
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        pid
    }

    pub(crate) fn command_line(&self, pid: u32) -> Option<String> {
        let mut system = self.system();
        let pid = Self::refresh_one(&mut system, pid);
        let process = system.process(pid)?;
        let parts: Vec<String> = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect();

        if parts.is_empty() {
            Some(process.name().to_string_lossy().into_owned())
        } else {
            Some(parts.join(" "))
        }
    }

    /// `Some(true)` when present and not a zombie, `None` when the table has no entry.
    pub(crate) fn is_running(&self, pid: u32) -> Option<bool> {
        let mut system = self.system();
        let pid = Self::refresh_one(&mut system, pid);
        system
            .process(pid)
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    pub(crate) fn descendants(&self, root: u32) -> Vec<u32> {
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }

        collect_descendants(root, &children)
    }

    pub(crate) fn resource_usage(&self, pid: u32) -> Option<ResourceUsage> {
        let mut system = self.system();
        let pid = Self::refresh_one(&mut system, pid);
        system.process(pid).map(|process| ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

/// Breadth-first walk of a parent -> children map, skipping the current process.
fn collect_descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let own_pid = std::process::id();
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.get(&parent) {
            for &child in kids {
                if child == own_pid || child == root || found.contains(&child) {
                    continue;
                }
                found.push(child);
                queue.push_back(child);
            }
        }
    }

    found
}
