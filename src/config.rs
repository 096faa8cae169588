//! Configuration management for svcwarden.
use serde::{Deserialize, Deserializer};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::warn;

use crate::{
    constants::{
        DEFAULT_CONFIG_FILE, DEFAULT_FORCE_TIMEOUT, DEFAULT_GRACEFUL_TIMEOUT,
        DEFAULT_LOG_CAPACITY, DEFAULT_PROBE_TIMEOUT, DEFAULT_RESTART_SETTLE,
        DEFAULT_STARTUP_GRACE, FALLBACK_CONFIG_FILE, WATCHDOG_POLL_INTERVAL,
        WATCHDOG_SWEEP_TIMEOUT,
    },
    error::SupervisorError,
    service::{ConfiguredCommand, ServiceDescriptor, ServiceIdentity},
};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Supervisor timing and buffer settings.
    #[serde(default)]
    pub settings: SupervisorSettings,
    /// Watchdog timing settings.
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    /// Map of service names to their respective configurations.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: Option<String>,
}

/// Timing and buffer settings of the supervisor.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Wait after spawn before checking for an immediate exit.
    #[serde(deserialize_with = "deserialize_duration")]
    pub startup_grace: Duration,
    /// Window granted to a graceful terminate.
    #[serde(deserialize_with = "deserialize_duration")]
    pub graceful_timeout: Duration,
    /// Window granted to a forced kill.
    #[serde(deserialize_with = "deserialize_duration")]
    pub force_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    #[serde(deserialize_with = "deserialize_duration")]
    pub restart_settle: Duration,
    /// Connect timeout for port probes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_timeout: Duration,
    /// Lines retained per service log.
    pub log_capacity: usize,
    /// Ask the kernel to terminate services when the supervisor dies (Linux only).
    pub terminate_on_parent_death: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_grace: DEFAULT_STARTUP_GRACE,
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
            restart_settle: DEFAULT_RESTART_SETTLE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            log_capacity: DEFAULT_LOG_CAPACITY,
            terminate_on_parent_death: true,
        }
    }
}

/// Timing settings handed to the watchdog process on its command line.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Liveness poll interval.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Upper bound for the parallel port sweep.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval: WATCHDOG_POLL_INTERVAL,
            sweep_timeout: WATCHDOG_SWEEP_TIMEOUT,
        }
    }
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// TCP port the service listens on.
    pub port: u16,
    /// Program and arguments used to start the service.
    pub command: Vec<String>,
    /// Working directory, relative to the config file when not absolute.
    pub cwd: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
    /// Named launch variants (e.g. `dev`) layered over the base command.
    #[serde(default)]
    pub modes: HashMap<String, ModeConfig>,
    /// Keywords recognising this service in a process table.
    #[serde(default)]
    pub identity: ServiceIdentity,
    /// Whether the service spawns children that must be terminated with it.
    #[serde(default)]
    pub kill_tree: bool,
}

/// A named launch variant of a service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModeConfig {
    /// Replaces the base command when present.
    pub command: Option<Vec<String>>,
    /// Appended to the (base or replaced) command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra variables, overriding the service environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

impl Config {
    /// Directory relative paths resolve against.
    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let mut owners: HashMap<u16, &str> = HashMap::new();

        for (name, service) in &self.services {
            if service.command.is_empty() {
                return Err(SupervisorError::InvalidConfig(format!(
                    "service '{name}' has an empty command"
                )));
            }
            if service.port == 0 {
                return Err(SupervisorError::InvalidConfig(format!(
                    "service '{name}' must declare a non-zero port"
                )));
            }
            if let Some(previous) = owners.insert(service.port, name) {
                return Err(SupervisorError::InvalidConfig(format!(
                    "services '{previous}' and '{name}' share port {}",
                    service.port
                )));
            }
            if service.identity.is_empty() {
                warn!(
                    "Service '{name}' has no identity keywords; leaked instances will never be adopted"
                );
            }
        }

        if self.settings.log_capacity == 0 {
            return Err(SupervisorError::InvalidConfig(
                "settings.log_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Converts every configured service into a descriptor, in name order.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        let root = self.project_root();
        self.services
            .iter()
            .map(|(name, service)| {
                let builder = ConfiguredCommand::new(name, service.clone(), root.clone());
                ServiceDescriptor::new(
                    name,
                    service.port,
                    service.identity.clone(),
                    Arc::new(builder),
                )
                .with_kill_tree(service.kill_tree)
            })
            .collect()
    }

    /// Every port the configured services listen on.
    pub fn known_ports(&self) -> Vec<u16> {
        self.services.values().map(|service| service.port).collect()
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, SupervisorError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SupervisorError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid =
        || SupervisorError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Loads, parses and validates the configuration file.
///
/// Without an explicit path, `warden.yaml` and then `warden.yml` are looked up in the
/// current directory.
pub fn load_config(config_path: Option<&str>) -> Result<Config, SupervisorError> {
    let config_path = config_path.map(Path::new).unwrap_or_else(|| {
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Path::new(DEFAULT_CONFIG_FILE)
        } else {
            Path::new(FALLBACK_CONFIG_FILE)
        }
    });

    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let mut config: Config =
        serde_yaml::from_str(&content).map_err(SupervisorError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    config.validate()?;
    Ok(config)
}
