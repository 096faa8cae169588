//! svcwarden supervises the local services of a multi-service assistant: it starts them,
//! captures their output, reports their status, and makes sure none of them outlives the
//! application. Leftovers from a crashed run are found by port and terminated only when
//! their command line matches the service, and a separate watchdog process sweeps every
//! known port once the supervisor itself disappears.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and default values.
pub mod constants;

/// Error handling.
pub mod error;

/// Platform process and socket introspection.
pub mod inspector;

/// Bounded output buffers and failure classification.
pub mod logs;

/// Port occupancy and ownership.
pub mod port;

/// Service descriptors and launch commands.
pub mod service;

/// The process supervisor.
pub mod supervisor;

/// Process tree termination.
pub mod tree;

/// The out-of-process watchdog.
pub mod watchdog;
