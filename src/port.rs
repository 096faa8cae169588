//! Port occupancy checks and owner lookup.
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

use crate::{
    constants::DEFAULT_PROBE_TIMEOUT, error::SupervisorError, inspector::ProcessInspector,
    service::ServiceIdentity,
};

/// A port owner whose command line was matched against a service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    /// Owning process.
    pub pid: u32,
    /// Its command line, when readable.
    pub command_line: Option<String>,
    /// Whether the command line satisfied the identity predicate.
    pub matches_identity: bool,
}

/// Answers "is this port taken, and by whom".
#[derive(Clone)]
pub struct PortProber {
    inspector: Arc<dyn ProcessInspector>,
    connect_timeout: Duration,
}

impl PortProber {
    /// Creates a prober using `inspector` for owner lookups.
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            inspector,
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Overrides the connect timeout used by [`PortProber::is_occupied`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns `true` when something accepts connections on `127.0.0.1:port` or, failing
    /// that, on `[::1]:port`.
    pub fn is_occupied(&self, port: u16) -> bool {
        [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
            .into_iter()
            .any(|ip| self.accepts(SocketAddr::new(ip, port)))
    }

    fn accepts(&self, addr: SocketAddr) -> bool {
        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(_) => true,
            Err(err) => {
                debug!("Probe of {addr}: {err}");
                false
            }
        }
    }

    /// Pid listening on `port`. Never authorizes a kill on its own: check the identity
    /// with [`PortProber::resolve_owner`] first.
    pub fn find_owner(&self, port: u16) -> Result<Option<u32>, SupervisorError> {
        self.inspector.listener_pid(port)
    }

    /// Finds the owner of `port` and evaluates `identity` against its command line.
    pub fn resolve_owner(
        &self,
        port: u16,
        identity: &ServiceIdentity,
    ) -> Result<Option<PortOwner>, SupervisorError> {
        let Some(pid) = self.find_owner(port)? else {
            return Ok(None);
        };

        let command_line = self.inspector.command_line(pid);
        let matches_identity = command_line
            .as_deref()
            .is_some_and(|line| identity.matches(line));

        Ok(Some(PortOwner {
            pid,
            command_line,
            matches_identity,
        }))
    }
}
