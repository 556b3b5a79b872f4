//! Configuration management for lillia.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    constants::{
        BOT_RUNTIME_NAME, CONTROL_PLANE_NAME, DEFAULT_CONTROL_PLANE_PORT, DEFAULT_LOG_CAPACITY,
        DEFAULT_PORT_ATTEMPTS, FORCEFUL_STOP_TIMEOUT, GRACEFUL_STOP_TIMEOUT, LOG_DRAIN_INTERVAL,
        RPC_TIMEOUT, SAMPLE_INTERVAL, STARTUP_GRACE, WATCHDOG_INTERVAL,
    },
    discovery::DiscoverySettings,
    error::ProcessManagerError,
    supervisor::{BotRuntimeLaunch, ControlPlaneLaunch},
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "lillia.yaml";

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// The control-plane (bridge) process.
    pub control_plane: ControlPlaneConfig,
    /// Optional bot runtime launched against the control plane.
    pub bot_runtime: Option<BotRuntimeConfig>,
    /// Supervisor tuning knobs.
    #[serde(default)]
    pub supervisor: SupervisorSection,
    /// Directory relative paths are resolved from.
    #[serde(skip)]
    pub project_dir: Option<String>,
}

/// Control-plane process settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneConfig {
    /// Managed process name.
    #[serde(default = "default_control_plane_name")]
    pub name: String,
    /// Executable path.
    pub path: String,
    /// Passed as `--qq-path=` when non-empty.
    #[serde(default)]
    pub qq_path: String,
    /// Account to log in automatically, passed as `--qq=` when non-empty.
    #[serde(default)]
    pub auto_login: String,
    /// Passes `--headless` when set.
    #[serde(default)]
    pub headless: bool,
    /// First port probed for the RPC endpoint.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Extra arguments appended after the generated flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the process.
    pub working_dir: Option<String>,
}

/// Bot runtime process settings.
#[derive(Debug, Deserialize, Clone)]
pub struct BotRuntimeConfig {
    /// Managed process name.
    #[serde(default = "default_bot_runtime_name")]
    pub name: String,
    /// Node.js executable; a bare name is looked up on `PATH`.
    #[serde(default = "default_node_path")]
    pub node_path: String,
    /// Entry script.
    pub script_path: String,
    /// Extra arguments appended after the port flag.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the process.
    pub working_dir: Option<String>,
}

/// Raw `supervisor:` section. Missing fields fall back to defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SupervisorSection {
    pub log_capacity: Option<usize>,
    pub startup_grace_ms: Option<u64>,
    pub graceful_stop_ms: Option<u64>,
    pub forceful_stop_ms: Option<u64>,
    pub watchdog_interval_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
    pub discovery_retry_ms: Option<u64>,
    pub identity_max_attempts: Option<u32>,
    pub sample_interval_ms: Option<u64>,
    pub log_drain_interval_ms: Option<u64>,
}

/// Resolved timing and capacity settings used by the supervisor and its loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub log_capacity: usize,
    pub startup_grace: Duration,
    pub graceful_stop: Duration,
    pub forceful_stop: Duration,
    pub watchdog_interval: Duration,
    pub rpc_timeout: Duration,
    pub discovery: DiscoverySettings,
    pub sample_interval: Duration,
    pub log_drain_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            startup_grace: STARTUP_GRACE,
            graceful_stop: GRACEFUL_STOP_TIMEOUT,
            forceful_stop: FORCEFUL_STOP_TIMEOUT,
            watchdog_interval: WATCHDOG_INTERVAL,
            rpc_timeout: RPC_TIMEOUT,
            discovery: DiscoverySettings::default(),
            sample_interval: SAMPLE_INTERVAL,
            log_drain_interval: LOG_DRAIN_INTERVAL,
        }
    }
}

impl From<&SupervisorSection> for SupervisorSettings {
    fn from(section: &SupervisorSection) -> Self {
        let defaults = Self::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };

        Self {
            log_capacity: section.log_capacity.unwrap_or(defaults.log_capacity),
            startup_grace: ms(section.startup_grace_ms, defaults.startup_grace),
            graceful_stop: ms(section.graceful_stop_ms, defaults.graceful_stop),
            forceful_stop: ms(section.forceful_stop_ms, defaults.forceful_stop),
            watchdog_interval: ms(section.watchdog_interval_ms, defaults.watchdog_interval),
            rpc_timeout: ms(section.rpc_timeout_ms, defaults.rpc_timeout),
            discovery: DiscoverySettings {
                retry_delay: ms(section.discovery_retry_ms, defaults.discovery.retry_delay),
                identity_max_attempts: section
                    .identity_max_attempts
                    .unwrap_or(defaults.discovery.identity_max_attempts),
            },
            sample_interval: ms(section.sample_interval_ms, defaults.sample_interval),
            log_drain_interval: ms(section.log_drain_interval_ms, defaults.log_drain_interval),
        }
    }
}

fn default_control_plane_name() -> String {
    CONTROL_PLANE_NAME.to_string()
}

fn default_bot_runtime_name() -> String {
    BOT_RUNTIME_NAME.to_string()
}

fn default_node_path() -> String {
    "node".to_string()
}

fn default_base_port() -> u16 {
    DEFAULT_CONTROL_PLANE_PORT
}

impl Config {
    /// Supervisor settings with defaults applied.
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings::from(&self.supervisor)
    }

    fn base_dir(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Launch description of the control plane, paths resolved against the config directory.
    pub fn control_plane_launch(&self) -> ControlPlaneLaunch {
        let base = self.base_dir();
        let section = &self.control_plane;

        ControlPlaneLaunch {
            name: section.name.clone(),
            executable: resolve_path(&base, &section.path),
            qq_path: section.qq_path.clone(),
            auto_login: section.auto_login.clone(),
            headless: section.headless,
            base_port: section.base_port,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            extra_args: section.args.clone(),
            working_dir: section
                .working_dir
                .as_deref()
                .map(|dir| resolve_path(&base, dir)),
        }
    }

    /// Launch description of the bot runtime, if configured.
    pub fn bot_runtime_launch(&self) -> Option<BotRuntimeLaunch> {
        let base = self.base_dir();
        self.bot_runtime.as_ref().map(|section| BotRuntimeLaunch {
            name: section.name.clone(),
            node: if is_bare_command(&section.node_path) {
                PathBuf::from(&section.node_path)
            } else {
                resolve_path(&base, &section.node_path)
            },
            script: resolve_path(&base, &section.script_path),
            extra_args: section.args.clone(),
            working_dir: section
                .working_dir
                .as_deref()
                .map(|dir| resolve_path(&base, dir)),
        })
    }

    /// Checks the fields that serde cannot.
    pub fn validate(&self) -> Result<(), ProcessManagerError> {
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty"));
        }
        if self.control_plane.name.trim().is_empty() {
            return Err(invalid("control_plane.name must not be empty"));
        }
        if self.control_plane.path.trim().is_empty() {
            return Err(invalid("control_plane.path must not be empty"));
        }

        if let Some(bot) = &self.bot_runtime {
            if bot.name.trim().is_empty() {
                return Err(invalid("bot_runtime.name must not be empty"));
            }
            if bot.name == self.control_plane.name {
                return Err(invalid(
                    "bot_runtime.name must differ from control_plane.name",
                ));
            }
            if bot.node_path.trim().is_empty() {
                return Err(invalid("bot_runtime.node_path must not be empty"));
            }
            if bot.script_path.trim().is_empty() {
                return Err(invalid("bot_runtime.script_path must not be empty"));
            }
        }

        let settings = self.settings();
        if settings.log_capacity == 0 {
            return Err(invalid("supervisor.log_capacity must be greater than zero"));
        }
        for (field, value) in [
            ("watchdog_interval_ms", settings.watchdog_interval),
            ("rpc_timeout_ms", settings.rpc_timeout),
            ("sample_interval_ms", settings.sample_interval),
            ("log_drain_interval_ms", settings.log_drain_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(&format!(
                    "supervisor.{field} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ProcessManagerError {
    ProcessManagerError::ConfigInvalid(message.to_string())
}

fn is_bare_command(value: &str) -> bool {
    !value.contains('/') && !value.contains('\\')
}

/// Resolves `value` against `base` unless it is absolute or already exists.
fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Expands `${VAR}` and `$VAR` references from the environment.
fn expand_env_vars(input: &str) -> Result<String, ProcessManagerError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ProcessManagerError::ConfigInvalid(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var_name) = missing {
        return Err(ProcessManagerError::ConfigInvalid(format!(
            "Missing environment variable: {var_name}"
        )));
    }
    Ok(result.to_string())
}

/// Loads, expands and validates the configuration file.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ProcessManagerError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        ProcessManagerError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)
        .map_err(ProcessManagerError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    config.validate()?;
    Ok(config)
}
