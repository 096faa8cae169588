//! Error handling for svcwarden.
use thiserror::Error;

/// Defines all possible errors raised inside the supervisor, the port prober, the tree
/// killer and the watchdog. Public supervisor operations never hand these to callers; they
/// are recorded in the service log and turned into a boolean at the operation boundary.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration is syntactically valid but semantically unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested service is not part of the configuration.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// The requested launch mode is not defined for the service.
    #[error("Service '{service}' has no launch mode '{mode}'")]
    UnknownMode {
        /// The service name.
        service: String,
        /// The requested mode.
        mode: String,
    },

    /// The operating system refused to spawn the service process.
    #[error("Failed to spawn service '{service}': {source}")]
    SpawnError {
        /// The service that failed to spawn.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The process exited before the startup grace period elapsed.
    #[error("Service '{service}' exited during startup: {detail}")]
    StartupFailure {
        /// The service that failed.
        service: String,
        /// Exit status and classification of the captured output.
        detail: String,
    },

    /// The port is held by a process that does not match the service identity.
    #[error("Port {port} is occupied by a foreign process{}", owner_suffix(.pid))]
    PortConflict {
        /// The contested port.
        port: u16,
        /// Owner of the port, when it could be resolved.
        pid: Option<u32>,
    },

    /// A process survived both the graceful and the forced termination windows.
    #[error("Process {pid} is still alive after forced termination")]
    TerminationTimeout {
        /// The surviving process.
        pid: u32,
    },

    /// Delivering a signal (or its platform equivalent) failed.
    #[error("Failed to signal process {pid}: {source}")]
    SignalError {
        /// The target process.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Process or socket introspection is unavailable or failed.
    #[error("Process enumeration failed: {0}")]
    ProcessEnumerationError(String),

    /// A single port failed during the watchdog sweep.
    #[error("Watchdog sweep failed for port {port}: {reason}")]
    WatchdogSweepError {
        /// The port being swept.
        port: u16,
        /// Why the sweep of this port failed.
        reason: String,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

fn owner_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (PID {pid})"),
        None => String::new(),
    }
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `SupervisorError`.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}
