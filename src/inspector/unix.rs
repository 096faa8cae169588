//! Unix inspector: `nix` signals, `sysinfo` process table, and port ownership via
//! `/proc/net/tcp` on Linux with `lsof`/`ss` as fallbacks.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{io, process::Command};
use tracing::debug;

use super::{KillSignal, ProcessInspector, ProcessTable, ResourceUsage};
use crate::error::SupervisorError;

/// Inspector for Linux, macOS and the BSDs.
pub struct UnixInspector {
    table: ProcessTable,
}

impl UnixInspector {
    /// Creates the inspector.
    pub fn new() -> Self {
        Self {
            table: ProcessTable::new(),
        }
    }
}

impl Default for UnixInspector {
    fn default() -> Self {
        Self::new()
    }
}

fn to_nix_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
}

impl ProcessInspector for UnixInspector {
    fn listener_pid(&self, port: u16) -> Result<Option<u32>, SupervisorError> {
        let own_pid = std::process::id();
        let mut attempts = Vec::new();

        #[cfg(target_os = "linux")]
        {
            match procfs::listener_pid(port) {
                Ok(Some(pid)) if pid != own_pid => return Ok(Some(pid)),
                Ok(_) => attempts.push(Ok(())),
                Err(err) => attempts.push(Err(err)),
            }
        }

        for lookup in [lsof_listener as fn(u16) -> io::Result<Vec<u32>>, ss_listener] {
            match lookup(port) {
                Ok(pids) => {
                    if let Some(pid) = pids.into_iter().find(|pid| *pid != own_pid) {
                        return Ok(Some(pid));
                    }
                    attempts.push(Ok(()));
                }
                Err(err) => {
                    debug!("Port owner lookup for {port} failed: {err}");
                    attempts.push(Err(err));
                }
            }
        }

        if attempts.iter().any(Result::is_ok) {
            Ok(None)
        } else {
            let reasons: Vec<String> = attempts
                .into_iter()
                .filter_map(Result::err)
                .map(|err| err.to_string())
                .collect();
            Err(SupervisorError::ProcessEnumerationError(format!(
                "no usable socket introspection for port {port}: {}",
                reasons.join("; ")
            )))
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.table.command_line(pid)
    }

    fn descendants(&self, pid: u32) -> Result<Vec<u32>, SupervisorError> {
        Ok(self.table.descendants(pid))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = to_nix_pid(pid) else {
            return false;
        };

        match signal::kill(target, None) {
            Err(Errno::ESRCH) => false,
            // EPERM still proves the process exists.
            Ok(()) | Err(_) => self.table.is_running(pid).unwrap_or(true),
        }
    }

    fn signal(&self, pid: u32, kill_signal: KillSignal) -> Result<(), SupervisorError> {
        let target = to_nix_pid(pid).ok_or_else(|| SupervisorError::SignalError {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a process id"),
        })?;

        let sig = match kill_signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };

        match signal::kill(target, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(SupervisorError::SignalError {
                pid,
                source: io::Error::from_raw_os_error(err as i32),
            }),
        }
    }

    fn resource_usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.table.resource_usage(pid)
    }
}

fn run_tool(program: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(program).args(args).output()?;
    // lsof exits 1 when nothing matches; an empty result is still an answer.
    if !output.status.success() && !output.stderr.is_empty() && output.stdout.is_empty() {
        return Err(io::Error::other(format!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn lsof_listener(port: u16) -> io::Result<Vec<u32>> {
    let filter = format!("-iTCP:{port}");
    let stdout = run_tool("lsof", &["-nP", &filter, "-sTCP:LISTEN", "-t"])?;
    Ok(parse_lsof_pids(&stdout))
}

fn ss_listener(port: u16) -> io::Result<Vec<u32>> {
    let filter = format!("sport = :{port}");
    let stdout = run_tool("ss", &["-ltnp", &filter])?;
    Ok(parse_ss_pids(&stdout))
}

fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Extracts `pid=N` entries from `ss -p` output, e.g. `users:(("python",pid=42,fd=3))`.
fn parse_ss_pids(stdout: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in stdout.lines() {
        for part in line.split([',', '(', ')']) {
            if let Some(pid) = part.strip_prefix("pid=").and_then(|raw| raw.parse().ok())
                && !pids.contains(&pid)
            {
                pids.push(pid);
            }
        }
    }
    pids
}

#[cfg(target_os = "linux")]
mod procfs {
    //! Direct socket table introspection through `/proc`.
    use std::{fs, io};

    const TCP_LISTEN: &str = "0A";

    /// Socket inodes listening on `port`, read from one `/proc/net/tcp*` table.
    pub(super) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let local = fields.get(1)?;
                let state = fields.get(3)?;
                let inode = fields.get(9)?;
                let (_, port_hex) = local.rsplit_once(':')?;
                let local_port = u16::from_str_radix(port_hex, 16).ok()?;
                (local_port == port && *state == TCP_LISTEN)
                    .then(|| inode.parse::<u64>().ok())
                    .flatten()
                    .filter(|inode| *inode != 0)
            })
            .collect()
    }

    pub(super) fn listener_pid(port: u16) -> io::Result<Option<u32>> {
        let mut inodes = Vec::new();
        let mut readable = false;
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(table) = fs::read_to_string(path) {
                readable = true;
                inodes.extend(listening_inodes(&table, port));
            }
        }

        if !readable {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "/proc/net/tcp is not readable",
            ));
        }
        if inodes.is_empty() {
            return Ok(None);
        }

        let own_pid = std::process::id();
        let targets: Vec<String> = inodes
            .iter()
            .map(|inode| format!("socket:[{inode}]"))
            .collect();

        for entry in fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            // Processes of other users are unreadable; skip them quietly.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path())
                    && targets.iter().any(|target| link.as_os_str() == target.as_str())
                {
                    return Ok(Some(pid));
                }
            }
        }

        Ok(None)
    }
}
