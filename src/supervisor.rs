//! The process supervisor: owns the process table and drives service lifecycles.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, mpsc},
    thread,
    time::{Duration, Instant},
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, SupervisorSettings, WatchdogSettings},
    constants::{READER_DRAIN_TIMEOUT, UNMANAGED_NOTE},
    error::SupervisorError,
    inspector::{ProcessInspector, default_inspector},
    logs::{LogBuffer, classify_failure, spawn_log_reader},
    port::PortProber,
    service::ServiceDescriptor,
    tree::ProcessTreeKiller,
    watchdog::spawn_watchdog_process,
};

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Coarse status reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatusKind {
    Running,
    Stopped,
    Unknown,
}

/// Result of [`ProcessSupervisor::get_service_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    pub port: u16,
    /// Set when the port is held by a process this supervisor did not start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ServiceStatus {
    fn bare(status: StatusKind, port: u16) -> Self {
        Self {
            status,
            pid: None,
            cpu_percent: None,
            memory_mb: None,
            port,
            note: None,
        }
    }

    /// Whether the service (managed or not) is up.
    pub fn is_running(&self) -> bool {
        self.status == StatusKind::Running
    }
}

/// Read-only view of a tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub state: ServiceState,
}

/// A child process started and tracked by the supervisor.
pub struct ManagedProcess {
    service_name: String,
    child: Child,
    pid: u32,
    start_time: DateTime<Utc>,
    state: ServiceState,
    log: LogBuffer,
    reader: Option<thread::JoinHandle<()>>,
    /// Keeps the spawning thread alive; dropping it lets that thread exit.
    _spawner: Option<mpsc::Sender<()>>,
}

impl ManagedProcess {
    /// Name of the service this process belongs to.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Output buffer shared with the reader thread.
    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            start_time: self.start_time,
            state: self.state,
        }
    }

    /// `None` while the child runs. Reaps the child once it exited.
    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!(
                    "Failed to poll PID {} of '{}': {err}",
                    self.pid, self.service_name
                );
                None
            }
        }
    }

    /// Waits (bounded) for the reader thread to hit EOF so trailing output is captured.
    fn drain_output(&mut self, timeout: Duration) {
        let Some(handle) = self.reader.take() else {
            return;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!(
                "Output of '{}' still open after exit; a descendant holds the pipe",
                self.service_name
            );
        }
    }

    /// Collects the exit status of a process already confirmed dead.
    fn reap(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.exit_status() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

/// The process table: live entries plus the last known state of every service.
#[derive(Default)]
struct ProcessTable {
    processes: HashMap<String, ManagedProcess>,
    states: HashMap<String, ServiceState>,
}

impl ProcessTable {
    fn set_state(&mut self, service: &str, state: ServiceState) {
        if let Some(process) = self.processes.get_mut(service) {
            process.state = state;
        }
        self.states.insert(service.to_string(), state);
    }

    /// Drops the entry of `service` once its process exited on its own. `Starting` entries
    /// are left to the start call that owns them.
    fn reconcile(&mut self, service: &str) {
        let Some(process) = self.processes.get_mut(service) else {
            return;
        };
        if process.state == ServiceState::Starting {
            return;
        }
        let Some(status) = process.exit_status() else {
            return;
        };

        info!(
            "Service '{service}' (PID {}) exited on its own ({status})",
            process.pid
        );
        process.log.note(format!("exited ({status})"));
        self.processes.remove(service);
        self.states.insert(service.to_string(), ServiceState::Stopped);
    }

    fn reconcile_all(&mut self) {
        let names: Vec<String> = self.processes.keys().cloned().collect();
        for name in names {
            self.reconcile(&name);
        }
    }
}

/// Starts, stops and observes a fixed set of services.
///
/// Locks are always taken in the order `lifecycle` -> `table` -> `logs`. Lifecycle
/// operations hold `lifecycle` for their whole duration; queries only take `table` or
/// `logs` briefly and are never blocked by a stop waiting out its graceful window.
pub struct ProcessSupervisor {
    services: BTreeMap<String, ServiceDescriptor>,
    settings: SupervisorSettings,
    watchdog_settings: WatchdogSettings,
    inspector: Arc<dyn ProcessInspector>,
    prober: PortProber,
    killer: ProcessTreeKiller,
    lifecycle: Mutex<()>,
    table: Mutex<ProcessTable>,
    logs: Mutex<HashMap<String, LogBuffer>>,
    watchdog: Mutex<Option<Child>>,
}

impl ProcessSupervisor {
    /// Builds a supervisor for `config` and sweeps processes left over by a previous run.
    pub fn new(config: &Config) -> Result<Self, SupervisorError> {
        let supervisor = Self::observer(config)?;
        let terminated = supervisor.cleanup_hanging_processes();
        if !terminated.is_empty() {
            info!("Terminated {} hanging process(es): {terminated:?}", terminated.len());
        }
        Ok(supervisor)
    }

    /// Builds a supervisor without the startup sweep, for callers that only observe or
    /// stop services (for example a status command running next to a live supervisor).
    pub fn observer(config: &Config) -> Result<Self, SupervisorError> {
        config.validate()?;
        Ok(
            Self::with_inspector(
                config.descriptors(),
                config.settings.clone(),
                default_inspector(),
            )
            .with_watchdog_settings(config.watchdog.clone()),
        )
    }

    /// Assembles a supervisor from explicit parts. Does not run the startup sweep.
    pub fn with_inspector(
        descriptors: Vec<ServiceDescriptor>,
        settings: SupervisorSettings,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let mut services = BTreeMap::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if services.insert(name.clone(), descriptor).is_some() {
                warn!("Duplicate service '{name}'; the last definition wins");
            }
        }

        let prober =
            PortProber::new(inspector.clone()).with_connect_timeout(settings.probe_timeout);
        let killer = ProcessTreeKiller::new(
            inspector.clone(),
            settings.graceful_timeout,
            settings.force_timeout,
        );

        Self {
            services,
            settings,
            watchdog_settings: WatchdogSettings::default(),
            inspector,
            prober,
            killer,
            lifecycle: Mutex::new(()),
            table: Mutex::new(ProcessTable::default()),
            logs: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
        }
    }

    /// Replaces the timing handed to the watchdog process.
    pub fn with_watchdog_settings(mut self, settings: WatchdogSettings) -> Self {
        self.watchdog_settings = settings;
        self
    }

    /// Configured services, in name order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Every configured port.
    pub fn known_ports(&self) -> Vec<u16> {
        self.services.values().map(|service| service.port).collect()
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`: a panic elsewhere leaves nothing inconsistent.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log_buffer(&self, service: &str) -> LogBuffer {
        let mut logs = self
            .logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.entry(service.to_string())
            .or_insert_with(|| LogBuffer::new(self.settings.log_capacity))
            .clone()
    }

    fn set_state(&self, service: &str, state: ServiceState) {
        match self.table.lock() {
            Ok(mut table) => table.set_state(service, state),
            Err(err) => error!("Cannot record state {state} for '{service}': {err}"),
        }
    }

    /// Starts `name` in launch `mode`.
    ///
    /// Returns `true` when the service is running afterwards, including when it already was.
    /// Returns `false` when the service is unknown, cannot be spawned, or exits within the
    /// startup grace period; the reason is written to the service log.
    pub fn start_service(&self, name: &str, mode: &str) -> bool {
        let Some(service) = self.services.get(name) else {
            warn!("Cannot start unknown service '{name}'");
            return false;
        };

        let _lifecycle = self.lifecycle_guard();
        let log = self.log_buffer(name);

        match self.start_locked(service, mode, &log) {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to start service '{name}': {err}");
                log.note(format!("start failed: {err}"));
                self.set_state(name, ServiceState::Failed);
                false
            }
        }
    }

    fn start_locked(
        &self,
        service: &ServiceDescriptor,
        mode: &str,
        log: &LogBuffer,
    ) -> Result<(), SupervisorError> {
        let name = service.name.as_str();

        {
            let mut table = self.table.lock()?;
            if let Some(existing) = table.processes.get_mut(name) {
                match existing.exit_status() {
                    None => {
                        debug!("Service '{name}' already running as PID {}", existing.pid);
                        return Ok(());
                    }
                    Some(status) => {
                        info!("Replacing exited instance of '{name}' ({status})");
                        table.processes.remove(name);
                    }
                }
            }
            table.set_state(name, ServiceState::Starting);
        }

        if self.prober.is_occupied(service.port) {
            warn!(
                "Port {} is already in use before '{name}' starts; the new instance may fail",
                service.port
            );
            log.note(format!("port {} is already in use", service.port));
        }

        let spec = service.command(mode)?;
        let spawn_err = |source: std::io::Error| SupervisorError::SpawnError {
            service: name.to_string(),
            source,
        };

        let (output, writer) = std::io::pipe().map_err(spawn_err)?;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(writer.try_clone().map_err(spawn_err)?)
            .stderr(writer);
        configure_child(&mut cmd, self.settings.terminate_on_parent_death);

        debug!("Launching '{name}': {cmd:?}");
        let parent_thread = cfg!(target_os = "linux") && self.settings.terminate_on_parent_death;
        let (child, spawner) = if parent_thread {
            let (child, release) = spawn_from_parent_thread(name, cmd).map_err(spawn_err)?;
            (child, Some(release))
        } else {
            let spawned = cmd.spawn();
            // The command owns the parent's copies of the pipe writer; the reader only sees
            // EOF once they are gone.
            drop(cmd);
            (spawned.map_err(spawn_err)?, None)
        };

        let pid = child.id();
        info!("Service '{name}' started with PID {pid}");
        log.note(format!("started PID {pid}: {}", spec.display_line()));

        let reader = match spawn_log_reader(name, output, log.clone()) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Could not start output reader for '{name}': {err}");
                None
            }
        };

        self.table.lock()?.processes.insert(
            name.to_string(),
            ManagedProcess {
                service_name: name.to_string(),
                child,
                pid,
                start_time: Utc::now(),
                state: ServiceState::Starting,
                log: log.clone(),
                reader,
                _spawner: spawner,
            },
        );

        thread::sleep(self.settings.startup_grace);

        let mut table = self.table.lock()?;
        let exit = table
            .processes
            .get_mut(name)
            .map(ManagedProcess::exit_status)
            .unwrap_or_default();

        match exit {
            None => {
                table.set_state(name, ServiceState::Running);
                Ok(())
            }
            Some(status) => {
                let mut failed = table.processes.remove(name);
                drop(table);

                if let Some(process) = failed.as_mut() {
                    process.drain_output(READER_DRAIN_TIMEOUT);
                }

                let mut detail = format!("exited with {status}");
                if let Some(kind) = classify_failure(&log.snapshot()) {
                    detail.push_str(&format!(" ({kind}: {})", kind.hint()));
                }
                Err(SupervisorError::StartupFailure {
                    service: name.to_string(),
                    detail,
                })
            }
        }
    }

    /// Stops `name`.
    ///
    /// Tracked processes are terminated gracefully and then forcefully. Untracked services
    /// whose port is occupied go through the adoption path: the owner is killed only when its
    /// command line matches the service identity. Returns `true` when the service is not
    /// running afterwards (including when it never was), `false` when termination failed or
    /// the service is unknown.
    pub fn stop_service(&self, name: &str) -> bool {
        let Some(service) = self.services.get(name) else {
            warn!("Cannot stop unknown service '{name}'");
            return false;
        };

        let _lifecycle = self.lifecycle_guard();
        let log = self.log_buffer(name);

        match self.stop_locked(service, &log) {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to stop service '{name}': {err}");
                log.note(format!("stop failed: {err}"));
                false
            }
        }
    }

    fn stop_locked(
        &self,
        service: &ServiceDescriptor,
        log: &LogBuffer,
    ) -> Result<(), SupervisorError> {
        let name = service.name.as_str();

        let tracked = {
            let mut table = self.table.lock()?;
            let tracked = table.processes.remove(name);
            if tracked.is_some() {
                table.set_state(name, ServiceState::Stopping);
            }
            tracked
        };

        let Some(mut process) = tracked else {
            return self.adopt_and_stop(service, log);
        };

        if let Some(status) = process.exit_status() {
            // The pid may already belong to someone else; only the port can tell.
            debug!("Tracked instance of '{name}' already exited ({status})");
            self.set_state(name, ServiceState::Stopped);
            return self.adopt_and_stop(service, log);
        }

        info!("Stopping service '{name}' (PID {})", process.pid);
        log.note(format!("stopping PID {}", process.pid));

        if let Err(err) = self.terminate_service(service, process.pid) {
            if process.exit_status().is_none() {
                let mut table = self.table.lock()?;
                process.state = ServiceState::Running;
                table.processes.insert(name.to_string(), process);
                table.states.insert(name.to_string(), ServiceState::Running);
                return Err(err);
            }
            warn!("Service '{name}' exited despite a termination error: {err}");
        }

        match process.reap(self.settings.force_timeout) {
            Some(status) => log.note(format!("stopped ({status})")),
            None => warn!("Could not reap PID {} of '{name}'", process.pid),
        }
        // No drain here: a descendant may hold the pipe open past the stop window.
        self.set_state(name, ServiceState::Stopped);
        debug!("Service '{name}' stopped successfully.");
        Ok(())
    }

    /// Recovers control of a service whose port is held by a process this supervisor did
    /// not spawn. Foreign owners are left alone.
    fn adopt_and_stop(
        &self,
        service: &ServiceDescriptor,
        log: &LogBuffer,
    ) -> Result<(), SupervisorError> {
        let name = service.name.as_str();
        if !self.prober.is_occupied(service.port) {
            debug!("Service '{name}' is not running");
            return Ok(());
        }

        match self.prober.resolve_owner(service.port, &service.identity) {
            Ok(Some(owner)) if owner.matches_identity => {
                info!(
                    "Adopting untracked instance of '{name}' (PID {}) on port {}",
                    owner.pid, service.port
                );
                log.note(format!("stopping untracked instance PID {}", owner.pid));
                self.terminate_service(service, owner.pid)?;
                self.set_state(name, ServiceState::Stopped);
                Ok(())
            }
            Ok(owner) => {
                let conflict = SupervisorError::PortConflict {
                    port: service.port,
                    pid: owner.map(|owner| owner.pid),
                };
                warn!("Leaving port of '{name}' alone: {conflict}");
                log.note(conflict.to_string());
                Ok(())
            }
            Err(err) => {
                warn!("Cannot identify owner of port {}: {err}", service.port);
                log.note(format!("port {} owner unknown: {err}", service.port));
                Ok(())
            }
        }
    }

    fn terminate_service(
        &self,
        service: &ServiceDescriptor,
        pid: u32,
    ) -> Result<(), SupervisorError> {
        if service.kill_tree {
            self.killer.kill_tree(pid)
        } else {
            self.killer.terminate(pid)
        }
    }

    /// Stops, waits for the configured settle delay, and starts `name` again.
    pub fn restart_service(&self, name: &str, mode: &str) -> bool {
        if !self.stop_service(name) {
            return false;
        }
        thread::sleep(self.settings.restart_settle);
        self.start_service(name, mode)
    }

    /// Stops every configured service; returns `true` when all of them stopped.
    pub fn stop_all(&self) -> bool {
        let names: Vec<String> = self.services.keys().rev().cloned().collect();
        let mut all_stopped = true;
        for name in names {
            all_stopped &= self.stop_service(&name);
        }
        all_stopped
    }

    /// Reports whether `name` is running, with resource figures for managed processes.
    ///
    /// A tracked process that exited on its own is dropped from the table (state `Stopped`)
    /// and the port decides.
    pub fn get_service_status(&self, name: &str) -> ServiceStatus {
        let Some(service) = self.services.get(name) else {
            return ServiceStatus::bare(StatusKind::Unknown, 0);
        };

        let tracked_pid = match self.table.lock() {
            Ok(mut table) => {
                table.reconcile(name);
                table
                    .processes
                    .get_mut(name)
                    .and_then(|process| process.exit_status().is_none().then_some(process.pid))
            }
            Err(err) => {
                error!("Process table unavailable: {err}");
                return ServiceStatus::bare(StatusKind::Unknown, service.port);
            }
        };

        if let Some(pid) = tracked_pid {
            let usage = self.inspector.resource_usage(pid);
            return ServiceStatus {
                status: StatusKind::Running,
                pid: Some(pid),
                cpu_percent: usage.map(|usage| usage.cpu_percent),
                memory_mb: usage.map(|usage| usage.memory_bytes as f64 / (1024.0 * 1024.0)),
                port: service.port,
                note: None,
            };
        }

        if self.prober.is_occupied(service.port) {
            let pid = self.prober.find_owner(service.port).unwrap_or_else(|err| {
                debug!("Owner of port {} unknown: {err}", service.port);
                None
            });
            return ServiceStatus {
                pid,
                note: Some(UNMANAGED_NOTE.to_string()),
                ..ServiceStatus::bare(StatusKind::Running, service.port)
            };
        }

        ServiceStatus::bare(StatusKind::Stopped, service.port)
    }

    /// Last known lifecycle state of `name`.
    pub fn service_state(&self, name: &str) -> ServiceState {
        self.table
            .lock()
            .ok()
            .and_then(|mut table| {
                table.reconcile(name);
                table.states.get(name).copied()
            })
            .unwrap_or(ServiceState::NotStarted)
    }

    /// Snapshot of the tracked process of `name`.
    pub fn process_info(&self, name: &str) -> Option<ProcessInfo> {
        let mut table = self.table.lock().ok()?;
        table.reconcile(name);
        table.processes.get(name).map(ManagedProcess::info)
    }

    /// Names of services with a live process table entry.
    pub fn tracked_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .lock()
            .map(|mut table| {
                table.reconcile_all();
                table.processes.keys().cloned().collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Up to `limit` most recent log lines of `name`, oldest first.
    pub fn get_logs(&self, name: &str, limit: usize) -> Vec<String> {
        self.existing_log(name)
            .map(|log| log.tail(limit))
            .unwrap_or_default()
    }

    /// Log lines of `name` appended since sequence `seq`, and the next sequence to ask for.
    pub fn logs_since(&self, name: &str, seq: u64) -> (Vec<String>, u64) {
        self.existing_log(name)
            .map(|log| log.since(seq))
            .unwrap_or((Vec::new(), seq))
    }

    fn existing_log(&self, name: &str) -> Option<LogBuffer> {
        self.logs.lock().ok()?.get(name).cloned()
    }

    /// Terminates processes left behind by a crashed previous run.
    ///
    /// For every service whose port is occupied, the owner is terminated only when its
    /// command line matches the service identity. Dead, tracked, and already handled pids
    /// are skipped. Returns the pids that were terminated.
    pub fn cleanup_hanging_processes(&self) -> Vec<u32> {
        let _lifecycle = self.lifecycle_guard();

        let tracked: HashSet<u32> = match self.table.lock() {
            Ok(table) => table.processes.values().map(|process| process.pid).collect(),
            Err(err) => {
                error!("Skipping hanging process sweep: {err}");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut terminated = Vec::new();

        for service in self.services.values() {
            if !self.prober.is_occupied(service.port) {
                continue;
            }

            let owner = match self.prober.resolve_owner(service.port, &service.identity) {
                Ok(Some(owner)) => owner,
                Ok(None) => {
                    debug!("Port {} is occupied but its owner is unknown", service.port);
                    continue;
                }
                Err(err) => {
                    warn!("Cannot inspect port {} of '{}': {err}", service.port, service.name);
                    continue;
                }
            };

            if tracked.contains(&owner.pid) || !seen.insert(owner.pid) {
                continue;
            }

            let log = self.log_buffer(&service.name);
            if !owner.matches_identity {
                let conflict = SupervisorError::PortConflict {
                    port: service.port,
                    pid: Some(owner.pid),
                };
                warn!("Not touching port of '{}': {conflict}", service.name);
                log.note(conflict.to_string());
                continue;
            }

            if !self.inspector.is_alive(owner.pid) {
                debug!("Hanging PID {} already exited", owner.pid);
                continue;
            }

            info!(
                "Terminating hanging instance of '{}' (PID {}) on port {}",
                service.name, owner.pid, service.port
            );
            log.note(format!(
                "terminating leftover PID {} from a previous run",
                owner.pid
            ));
            match self.terminate_service(service, owner.pid) {
                Ok(()) => terminated.push(owner.pid),
                Err(err) => {
                    error!("Failed to terminate hanging PID {}: {err}", owner.pid);
                    log.note(format!("could not terminate PID {}: {err}", owner.pid));
                }
            }
        }

        terminated
    }

    /// Spawns the watchdog process once; later calls return the running watchdog's pid.
    pub fn spawn_watchdog(&self, executable: &Path) -> Result<u32, SupervisorError> {
        let mut slot = self.watchdog.lock()?;
        if let Some(existing) = slot.as_mut()
            && matches!(existing.try_wait(), Ok(None))
        {
            return Ok(existing.id());
        }

        let child = spawn_watchdog_process(
            executable,
            std::process::id(),
            &self.known_ports(),
            &self.watchdog_settings,
        )?;
        let pid = child.id();
        info!("Watchdog started with PID {pid}");
        *slot = Some(child);
        Ok(pid)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let table = self
            .table
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for (name, mut process) in table.processes.drain() {
            if process.exit_status().is_some() {
                continue;
            }
            debug!("Stopping '{name}' (PID {}) on supervisor drop", process.pid);
            let service = self.services.get(&name);
            let result = match service {
                Some(service) if service.kill_tree => self.killer.kill_tree(process.pid),
                _ => self.killer.terminate(process.pid),
            };
            if let Err(err) = result {
                error!("Failed to stop '{name}' on drop: {err}");
            }
            let _ = process.reap(self.settings.force_timeout);
        }
    }
}

/// Spawns `cmd` from a dedicated thread that outlives the call.
///
/// `PR_SET_PDEATHSIG` fires when the *thread* that forked the child exits, so the thread
/// parks until the returned sender is dropped together with its `ManagedProcess`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn spawn_from_parent_thread(
    name: &str,
    mut cmd: Command,
) -> std::io::Result<(Child, mpsc::Sender<()>)> {
    let (result_tx, result_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::Builder::new()
        .name(format!("parent-{name}"))
        .spawn(move || {
            let spawned = cmd.spawn();
            // The command owns the parent's copies of the pipe writer; the reader only sees
            // EOF once they are gone.
            drop(cmd);
            let launched = spawned.is_ok();
            if result_tx.send(spawned).is_ok() && launched {
                // Returns once the sender is dropped.
                let _ = release_rx.recv();
            }
        })?;

    let child = result_rx.recv().map_err(|err| {
        std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            format!("spawning thread failed to report launch status: {err}"),
        )
    })??;
    Ok((child, release_tx))
}

#[cfg(unix)]
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
fn configure_child(cmd: &mut Command, terminate_on_parent_death: bool) {
    use std::os::unix::process::CommandExt;

    // Own process group: terminal signals aimed at the supervisor do not reach services.
    cmd.process_group(0);

    #[cfg(target_os = "linux")]
    {
        if terminate_on_parent_death {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }
}

#[cfg(windows)]
fn configure_child(cmd: &mut Command, _terminate_on_parent_death: bool) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}
