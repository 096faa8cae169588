//! Constants and default configuration values for the supervisor and the watchdog.
//!
//! This module centralizes timing values, file names and well-known strings so the
//! supervisor, the tree killer and the watchdog agree on them.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "warden.yaml";

/// Secondary config file name.
pub const FALLBACK_CONFIG_FILE: &str = "warden.yml";

/// File name of the watchdog binary, expected next to the supervisor executable.
pub const WATCHDOG_BINARY_NAME: &str = "warden-watchdog";

// ============================================================================
// Supervisor Timing
// ============================================================================

/// Delay between spawning a service and checking whether it exited immediately.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How long a process may take to exit after a graceful terminate request.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a process may take to disappear after a forced kill.
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between the stop and start halves of a restart.
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_secs(1);

/// Connect timeout used when probing whether a port is occupied.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Interval between liveness checks while waiting for a process to exit.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for a reader thread to drain output after a startup failure.
pub const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Watchdog Timing
// ============================================================================

/// Liveness poll interval of the watchdog.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for the parallel port sweep.
pub const WATCHDOG_SWEEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Graceful window the watchdog grants each process before forcing it.
pub const WATCHDOG_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(1);

/// Forced-kill window used by the watchdog.
pub const WATCHDOG_FORCE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Logging and Output Constants
// ============================================================================

/// Default number of lines retained per service.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Prefix for lines the supervisor itself writes into a service log.
pub const SUPERVISOR_LOG_PREFIX: &str = "[warden]";

/// Note attached to a status report when the port is held by a process this supervisor
/// did not start.
pub const UNMANAGED_NOTE: &str = "not managed";

/// Launch mode used when the caller does not ask for a specific one.
pub const DEFAULT_MODE: &str = "default";
