//! Last-resort cleanup that runs in its own process.
//!
//! The watchdog knows only the supervisor pid and the configured ports. Once the supervisor
//! disappears, or the watchdog itself is asked to terminate, it kills whatever still holds
//! one of those ports and then the supervisor's own process tree.
use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::WatchdogSettings,
    constants::{WATCHDOG_BINARY_NAME, WATCHDOG_FORCE_TIMEOUT, WATCHDOG_GRACEFUL_TIMEOUT},
    error::SupervisorError,
    inspector::ProcessInspector,
    port::PortProber,
    tree::ProcessTreeKiller,
};

/// Watching -> Cleaning -> Exited, each entered once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum WatchdogState {
    Watching,
    Cleaning,
    Exited,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Pids terminated because they held a known port.
    pub killed: Vec<u32>,
    /// Ports whose parallel sweep did not report back before the deadline.
    pub timed_out: Vec<u16>,
    /// Per-port failures. Recorded and otherwise ignored.
    pub failures: Vec<SupervisorError>,
    /// Whether the supervisor's own tree was terminated.
    pub target_killed: bool,
}

impl SweepReport {
    fn record(&mut self, result: Result<Option<u32>, SupervisorError>) {
        match result {
            Ok(Some(pid)) => {
                if !self.killed.contains(&pid) {
                    self.killed.push(pid);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("{err}");
                self.failures.push(err);
            }
        }
    }
}

/// Watches one supervisor process and cleans up after it.
pub struct Watchdog {
    target_pid: u32,
    known_ports: Vec<u16>,
    state: WatchdogState,
    poll_interval: Duration,
    sweep_timeout: Duration,
    inspector: Arc<dyn ProcessInspector>,
    prober: PortProber,
    killer: ProcessTreeKiller,
    shutdown: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(
        target_pid: u32,
        ports: &[u16],
        settings: &WatchdogSettings,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let mut known_ports = ports.to_vec();
        known_ports.sort_unstable();
        known_ports.dedup();

        Self {
            target_pid,
            known_ports,
            state: WatchdogState::Watching,
            poll_interval: settings.poll_interval,
            sweep_timeout: settings.sweep_timeout,
            prober: PortProber::new(inspector.clone()),
            killer: ProcessTreeKiller::new(
                inspector.clone(),
                WATCHDOG_GRACEFUL_TIMEOUT,
                WATCHDOG_FORCE_TIMEOUT,
            ),
            inspector,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the tree killer, mostly to shorten its windows.
    pub fn with_killer(mut self, killer: ProcessTreeKiller) -> Self {
        self.killer = killer;
        self
    }

    /// Flag that, once set, makes [`Watchdog::run`] start cleaning immediately.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    pub fn known_ports(&self) -> &[u16] {
        &self.known_ports
    }

    /// Blocks until the target dies or shutdown is requested, then cleans up.
    ///
    /// A panic while watching also leads to cleanup. Returns `None` when the target was
    /// already gone at launch; nothing is swept then.
    pub fn run(&mut self) -> Option<SweepReport> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.watch())) {
            Ok(true) => {}
            Ok(false) => {
                self.state = WatchdogState::Exited;
                return None;
            }
            Err(_) => error!("Watch loop failed; cleaning up"),
        }

        Some(self.clean())
    }

    /// `false` when the target was not running to begin with.
    fn watch(&self) -> bool {
        if !self.inspector.is_alive(self.target_pid) {
            info!("Target PID {} is not running; nothing to watch", self.target_pid);
            return false;
        }

        info!(
            "Watching PID {} (ports {:?})",
            self.target_pid, self.known_ports
        );
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Termination requested; cleaning up");
                return true;
            }
            if !self.inspector.is_alive(self.target_pid) {
                info!("Target PID {} exited; cleaning up", self.target_pid);
                return true;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Sweeps every known port in parallel, then serially, then kills the target tree.
    pub fn clean(&mut self) -> SweepReport {
        self.state = WatchdogState::Cleaning;
        let mut report = SweepReport::default();

        self.sweep_parallel(&mut report);
        for &port in &self.known_ports {
            report.record(sweep_port(&self.prober, &self.killer, port));
        }

        if self.inspector.is_alive(self.target_pid) {
            match self.killer.kill_tree(self.target_pid) {
                Ok(()) => report.target_killed = true,
                Err(err) => warn!("Could not terminate target PID {}: {err}", self.target_pid),
            }
        }

        info!(
            "Cleanup finished: killed {:?}, {} failure(s)",
            report.killed,
            report.failures.len()
        );
        self.state = WatchdogState::Exited;
        report
    }

    fn sweep_parallel(&self, report: &mut SweepReport) {
        let (tx, rx) = mpsc::channel();
        let mut pending: HashSet<u16> = HashSet::new();

        for &port in &self.known_ports {
            let tx = tx.clone();
            let prober = self.prober.clone();
            let killer = self.killer.clone();
            let spawned = thread::Builder::new()
                .name(format!("sweep-{port}"))
                .spawn(move || {
                    let _ = tx.send((port, sweep_port(&prober, &killer, port)));
                });

            match spawned {
                Ok(_) => {
                    pending.insert(port);
                }
                Err(err) => report.record(Err(SupervisorError::WatchdogSweepError {
                    port,
                    reason: format!("could not start sweep thread: {err}"),
                })),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.sweep_timeout;
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((port, result)) => {
                    pending.remove(&port);
                    report.record(result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            let mut timed_out: Vec<u16> = pending.into_iter().collect();
            timed_out.sort_unstable();
            warn!("Sweep of ports {timed_out:?} did not finish in {:?}", self.sweep_timeout);
            report.timed_out = timed_out;
        }
    }
}

/// Kills whatever holds `port`. Returns the pid that was terminated, if any.
fn sweep_port(
    prober: &PortProber,
    killer: &ProcessTreeKiller,
    port: u16,
) -> Result<Option<u32>, SupervisorError> {
    if !prober.is_occupied(port) {
        return Ok(None);
    }

    let sweep_error = |reason: String| SupervisorError::WatchdogSweepError { port, reason };
    let Some(pid) = prober.find_owner(port).map_err(|err| sweep_error(err.to_string()))? else {
        debug!("Port {port} is occupied but has no visible owner");
        return Ok(None);
    };

    info!("Terminating PID {pid} holding port {port}");
    killer
        .kill_tree(pid)
        .map_err(|err| sweep_error(err.to_string()))?;
    Ok(Some(pid))
}

/// Path of the watchdog binary installed next to the current executable.
pub fn locate_watchdog_binary() -> Result<PathBuf, SupervisorError> {
    let current = std::env::current_exe().map_err(|source| SupervisorError::SpawnError {
        service: WATCHDOG_BINARY_NAME.to_string(),
        source,
    })?;
    let candidate = current
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{WATCHDOG_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX));

    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(SupervisorError::SpawnError {
            service: WATCHDOG_BINARY_NAME.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", candidate.display()),
            ),
        })
    }
}

/// Launches `executable` as the watchdog of `target_pid`, detached from the caller's session.
pub fn spawn_watchdog_process(
    executable: &Path,
    target_pid: u32,
    ports: &[u16],
    settings: &WatchdogSettings,
) -> Result<Child, SupervisorError> {
    let mut cmd = Command::new(executable);
    cmd.arg(target_pid.to_string())
        .args(ports.iter().map(u16::to_string))
        .arg("--poll-interval-ms")
        .arg(settings.poll_interval.as_millis().to_string())
        .arg("--sweep-timeout-ms")
        .arg(settings.sweep_timeout.as_millis().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    detach(&mut cmd);

    debug!("Launching watchdog: {cmd:?}");
    cmd.spawn().map_err(|source| SupervisorError::SpawnError {
        service: WATCHDOG_BINARY_NAME.to_string(),
        source,
    })
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}
