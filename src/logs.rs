//! Bounded per-service log buffers and the reader threads that fill them.
use std::{
    collections::VecDeque,
    io::{BufRead, BufReader, Read},
    sync::{Arc, Mutex, MutexGuard},
    thread,
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, trace, warn};

use crate::constants::SUPERVISOR_LOG_PREFIX;

#[derive(Debug)]
struct LogLines {
    lines: VecDeque<String>,
    /// Number of lines ever appended, including the ones already evicted.
    appended: u64,
}

/// Bounded FIFO of output lines. Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<LogLines>>,
    capacity: usize,
}

impl LogBuffer {
    /// Creates an empty buffer retaining at most `capacity` lines (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(LogLines {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                appended: 0,
            })),
            capacity,
        }
    }

    fn guard(&self) -> MutexGuard<'_, LogLines> {
        // A panicking writer cannot leave the deque half-updated, so the data is still usable.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maximum number of retained lines.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of lines currently retained.
    pub fn len(&self) -> usize {
        self.guard().lines.len()
    }

    /// Whether no line is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a line, evicting the oldest one when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut guard = self.guard();
        if guard.lines.len() == self.capacity {
            guard.lines.pop_front();
        }
        guard.lines.push_back(line.into());
        guard.appended += 1;
    }

    /// Appends a diagnostic line written by the supervisor itself.
    pub fn note(&self, message: impl AsRef<str>) {
        self.push(format!("{SUPERVISOR_LOG_PREFIX} {}", message.as_ref()));
    }

    /// Returns up to `limit` of the most recent lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let guard = self.guard();
        let skip = guard.lines.len().saturating_sub(limit);
        guard.lines.iter().skip(skip).cloned().collect()
    }

    /// Returns every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.guard().lines.iter().cloned().collect()
    }

    /// Sequence number of the next line to be appended.
    pub fn next_sequence(&self) -> u64 {
        self.guard().appended
    }

    /// Returns the retained lines appended at or after sequence `seq`, plus the sequence to
    /// pass on the next call. Lines evicted in between are silently skipped.
    pub fn since(&self, seq: u64) -> (Vec<String>, u64) {
        let guard = self.guard();
        let oldest = guard.appended - guard.lines.len() as u64;
        let start = seq.max(oldest).min(guard.appended);
        let skip = (start - oldest) as usize;
        (
            guard.lines.iter().skip(skip).cloned().collect(),
            guard.appended,
        )
    }
}

/// Spawns the thread that drains a merged output stream into `buffer` until EOF.
///
/// Invalid UTF-8 is replaced rather than dropped; trailing newlines are stripped.
pub fn spawn_log_reader<R>(
    service_name: &str,
    stream: R,
    buffer: LogBuffer,
) -> std::io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let service = service_name.to_string();
    thread::Builder::new()
        .name(format!("log-{service}"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end_matches(['\n', '\r']);
                        trace!("[{service}] {line}");
                        buffer.push(line);
                    }
                    Err(err) => {
                        warn!("Output reader for '{service}' failed: {err}");
                        break;
                    }
                }
            }
            debug!("Output stream of '{service}' closed");
        })
}

/// Best-effort label for why a service died during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// A module or package could not be imported.
    MissingDependency,
    /// The interpreter rejected the source.
    SyntaxError,
    /// Another process already holds the port.
    PortInUse,
    /// The OS refused access to a file or port.
    PermissionDenied,
    /// The program or interpreter does not exist.
    CommandNotFound,
}

impl FailureKind {
    /// Human readable hint for the log panel.
    pub fn hint(&self) -> &'static str {
        match self {
            FailureKind::MissingDependency => "a required module is not installed",
            FailureKind::SyntaxError => "the service source contains a syntax error",
            FailureKind::PortInUse => "the port is already in use",
            FailureKind::PermissionDenied => "permission was denied",
            FailureKind::CommandNotFound => "the command or interpreter was not found",
        }
    }
}

/// Scans the most recent lines for well-known failure signatures.
///
/// This is heuristic: the newest matching line wins and unknown failures return `None`.
pub fn classify_failure(lines: &[String]) -> Option<FailureKind> {
    const MAX_LINES: usize = 50;

    lines.iter().rev().take(MAX_LINES).find_map(|line| {
        let lower = line.to_ascii_lowercase();
        if lower.contains("modulenotfounderror")
            || lower.contains("importerror")
            || lower.contains("cannot find module")
        {
            Some(FailureKind::MissingDependency)
        } else if lower.contains("syntaxerror") {
            Some(FailureKind::SyntaxError)
        } else if lower.contains("address already in use")
            || lower.contains("os error 48")
            || lower.contains("os error 98")
            || lower.contains("eaddrinuse")
        {
            Some(FailureKind::PortInUse)
        } else if lower.contains("permission denied") || lower.contains("eacces") {
            Some(FailureKind::PermissionDenied)
        } else if lower.contains("command not found")
            || lower.contains("no such file or directory")
            || lower.contains("bad interpreter")
        {
            Some(FailureKind::CommandNotFound)
        } else {
            None
        }
    })
}
