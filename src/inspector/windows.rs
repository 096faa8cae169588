//! Windows inspector: `netstat -ano` for port ownership, `taskkill` for termination and
//! `sysinfo` for everything else.
use std::{io, process::Command};
use tracing::debug;

use super::{KillSignal, ProcessInspector, ProcessTable, ResourceUsage};
use crate::error::SupervisorError;

/// Inspector backed by the stock Windows command-line tools.
pub struct WindowsInspector {
    table: ProcessTable,
}

impl WindowsInspector {
    /// Creates the inspector.
    pub fn new() -> Self {
        Self {
            table: ProcessTable::new(),
        }
    }
}

impl Default for WindowsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for WindowsInspector {
    fn listener_pid(&self, port: u16) -> Result<Option<u32>, SupervisorError> {
        let output = Command::new("netstat")
            .args(["-ano", "-p", "TCP"])
            .output()
            .map_err(|err| {
                SupervisorError::ProcessEnumerationError(format!("netstat unavailable: {err}"))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let own_pid = std::process::id();
        Ok(parse_netstat_listener(&stdout, port).filter(|pid| *pid != own_pid))
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.table.command_line(pid)
    }

    fn descendants(&self, pid: u32) -> Result<Vec<u32>, SupervisorError> {
        Ok(self.table.descendants(pid))
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid != 0 && self.table.is_running(pid).unwrap_or(false)
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), SupervisorError> {
        let pid_arg = pid.to_string();
        let mut cmd = Command::new("taskkill");
        if signal == KillSignal::Kill {
            cmd.arg("/F");
        }
        cmd.args(["/PID", &pid_arg]);

        let output = cmd.output().map_err(|source| SupervisorError::SignalError { pid, source })?;
        if output.status.success() || !self.is_alive(pid) {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("taskkill for PID {pid} failed: {stderr}");
        Err(SupervisorError::SignalError {
            pid,
            source: io::Error::other(stderr),
        })
    }

    fn resource_usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.table.resource_usage(pid)
    }
}

/// Finds the owner of a `LISTENING` row such as `TCP 0.0.0.0:8000 0.0.0.0:0 LISTENING 1234`.
fn parse_netstat_listener(stdout: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [proto, local, _remote, state, pid]
                if proto.eq_ignore_ascii_case("TCP")
                    && local.ends_with(&suffix)
                    && state.eq_ignore_ascii_case("LISTENING") =>
            {
                pid.parse().ok()
            }
            _ => None,
        }
    })
}
