//! Service descriptors: what to launch, on which port, and how to recognise it afterwards.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tracing::{error, warn};

use crate::{
    config::{EnvConfig, ServiceConfig},
    constants::DEFAULT_MODE,
    error::SupervisorError,
};

/// Fully resolved launch instructions for one service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment layered over the supervisor's own environment.
    pub env: HashMap<String, String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
}

impl CommandSpec {
    /// Renders the argv the way it shows up in a process table.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Produces the argv/env/cwd of a service for a given launch mode.
pub trait CommandBuilder: Send + Sync + fmt::Debug {
    /// Builds the command for `mode`.
    fn build(&self, mode: &str) -> Result<CommandSpec, SupervisorError>;
}

/// Heuristic "is this our process" check over a process command line.
///
/// Every entry of `all` must appear in the command line and, when `any` is non-empty, at
/// least one of its entries must appear as well. An identity with no keywords matches
/// nothing, so an unconfigured service can never authorize a kill.
///
/// Two services configured with overlapping keywords (for example both only asking for
/// `node`) will recognise each other's processes. Keep the keywords specific.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Substrings that must all be present.
    #[serde(default)]
    pub all: Vec<String>,
    /// Substrings of which at least one must be present.
    #[serde(default)]
    pub any: Vec<String>,
}

impl ServiceIdentity {
    /// Creates an identity from required and alternative keywords.
    pub fn new<A, B>(all: A, any: B) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            all: all.into_iter().map(Into::into).collect(),
            any: any.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns `true` when no keyword is configured.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty()
    }

    /// Decides whether `command_line` belongs to this service.
    pub fn matches(&self, command_line: &str) -> bool {
        if self.is_empty() {
            return false;
        }

        let all_present = self
            .all
            .iter()
            .all(|needle| command_line.contains(needle.as_str()));
        let any_present = self.any.is_empty()
            || self
                .any
                .iter()
                .any(|needle| command_line.contains(needle.as_str()));

        all_present && any_present
    }
}

/// Immutable description of a supervised service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    /// Service name, unique within a supervisor.
    pub name: String,
    /// TCP port the service listens on.
    pub port: u16,
    /// Predicate recognising the service's processes.
    pub identity: ServiceIdentity,
    /// Whether the service fans out into child processes that must die with it.
    pub kill_tree: bool,
    builder: Arc<dyn CommandBuilder>,
}

impl ServiceDescriptor {
    /// Creates a descriptor around any command builder.
    pub fn new(
        name: impl Into<String>,
        port: u16,
        identity: ServiceIdentity,
        builder: Arc<dyn CommandBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            identity,
            kill_tree: false,
            builder,
        }
    }

    /// Marks the service as spawning child processes.
    pub fn with_kill_tree(mut self, kill_tree: bool) -> Self {
        self.kill_tree = kill_tree;
        self
    }

    /// Builds the launch command for `mode`.
    pub fn command(&self, mode: &str) -> Result<CommandSpec, SupervisorError> {
        self.builder.build(mode)
    }
}

/// Command builder backed by a service entry of the YAML configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredCommand {
    service_name: String,
    config: ServiceConfig,
    project_root: PathBuf,
}

impl ConfiguredCommand {
    /// Wraps a service configuration; relative paths resolve against `project_root`.
    pub fn new(
        service_name: impl Into<String>,
        config: ServiceConfig,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            config,
            project_root: project_root.into(),
        }
    }
}

impl CommandBuilder for ConfiguredCommand {
    fn build(&self, mode: &str) -> Result<CommandSpec, SupervisorError> {
        let mode_config = if mode == DEFAULT_MODE {
            None
        } else {
            Some(self.config.modes.get(mode).ok_or_else(|| {
                SupervisorError::UnknownMode {
                    service: self.service_name.clone(),
                    mode: mode.to_string(),
                }
            })?)
        };

        let mut env_vars =
            collect_service_env(&self.config.env, &self.project_root, &self.service_name);
        if let Some(mode_config) = mode_config {
            for (key, value) in &mode_config.env {
                env_vars.insert(key.clone(), value.clone());
            }
        }

        let base = mode_config
            .and_then(|mode_config| mode_config.command.as_ref())
            .unwrap_or(&self.config.command);
        let mut argv = base.clone();
        if let Some(mode_config) = mode_config {
            argv.extend(mode_config.args.iter().cloned());
        }

        let argv = argv
            .iter()
            .map(|arg| expand_env_vars(arg, &env_vars))
            .collect::<Result<Vec<_>, _>>()?;

        let mut parts = argv.into_iter();
        let program = parts.next().ok_or_else(|| {
            SupervisorError::InvalidConfig(format!(
                "service '{}' has an empty command",
                self.service_name
            ))
        })?;

        let cwd = match &self.config.cwd {
            Some(dir) => {
                let path = Path::new(dir);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.project_root.join(path)
                }
            }
            None => self.project_root.clone(),
        };

        Ok(CommandSpec {
            program,
            args: parts.collect(),
            env: env_vars,
            cwd,
        })
    }
}

/// Build the environment map for a service, giving inline `env.vars` precedence over entries loaded
/// from `env.file`.
fn collect_service_env(
    env: &Option<EnvConfig>,
    project_root: &Path,
    service_name: &str,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    if let Some(env_config) = env {
        if let Some(file_path) = env_config.path(project_root) {
            match fs::read_to_string(&file_path) {
                Ok(content) => {
                    for raw_line in content.lines() {
                        let line = raw_line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }

                        match line.split_once('=') {
                            Some((key, value)) => {
                                let value = value.trim();
                                let value = value
                                    .strip_prefix('"')
                                    .and_then(|inner| inner.strip_suffix('"'))
                                    .unwrap_or(value);
                                resolved
                                    .entry(key.trim().to_string())
                                    .or_insert_with(|| value.to_string());
                            }
                            None => warn!(
                                "Ignoring malformed line in env file for '{}': {}",
                                service_name, line
                            ),
                        }
                    }
                }
                Err(err) => {
                    error!("Failed to read env file for '{}': {}", service_name, err);
                }
            }
        }

        if let Some(vars) = &env_config.vars {
            for (key, value) in vars {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static pattern")
    })
}

/// Expands `$VAR` and `${VAR}` using the service environment first, then the process one.
fn expand_env_vars(
    input: &str,
    service_env: &HashMap<String, String>,
) -> Result<String, SupervisorError> {
    let mut missing = None;
    let expanded = env_var_pattern().replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match service_env.get(var_name) {
            Some(value) => value.clone(),
            None => env::var(var_name).unwrap_or_else(|_| {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }),
        }
    });

    match missing {
        Some(var_name) => Err(SupervisorError::InvalidConfig(format!(
            "missing environment variable: {var_name}"
        ))),
        None => Ok(expanded.into_owned()),
    }
}
