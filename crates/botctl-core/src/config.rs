//! Configuration resolution for botctl.
//!
//! Resolution order, lowest priority first:
//! 1. Built-in defaults (the automation application's service set)
//! 2. `botctl.toml` in the project root
//! 3. Environment variables (`BOTCTL_PYTHON`, `BOTCTL_ENV_FILE`, `OAUTH_PORT`)
//! 4. Command-line overrides
//!
//! The result is a [`Settings`] value built once per invocation and passed
//! by reference to every operation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::registry::{LaunchSpec, Registry, Service};

/// Optional configuration file, looked up in the project root.
pub const CONFIG_FILE: &str = "botctl.toml";

/// Placeholder in configured commands replaced by the resolved interpreter.
const PYTHON_PLACEHOLDER: &str = "{python}";

/// User id whose OAuth tokens the status report inspects.
pub const DEFAULT_TOKEN_USER: &str = "oauth_user";

/// OAuth callback server and SearXNG search backend.
pub const DEFAULT_PORTS: [u16; 2] = [8000, 8080];

/// Fixed waits and bounds of the process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait after launch before confirming the process survived.
    pub launch_grace: Duration,
    /// Interval between liveness polls while stopping.
    pub stop_poll_interval: Duration,
    /// Polls before escalating to a forced kill.
    pub stop_poll_attempts: u32,
    /// Pause between stop and start on restart.
    pub restart_pause: Duration,
    /// Poll interval while following a log file.
    pub follow_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            launch_grace: Duration::from_secs(3),
            stop_poll_interval: Duration::from_secs(1),
            stop_poll_attempts: 10,
            restart_pause: Duration::from_secs(2),
            follow_poll: Duration::from_millis(250),
        }
    }
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub python: Option<String>,
}

/// Complete supervisor configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_root: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Env file exported into every service; may not exist yet.
    pub env_file: PathBuf,
    /// Program used to run the external application.
    pub python: String,
    pub registry: Registry,
    pub timing: Timing,
    /// Listener ports shown by `status`.
    pub ports: Vec<u16>,
    pub token_user_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    python: Option<String>,
    env_file: Option<PathBuf>,
    pid_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    ports: Option<Vec<u16>>,
    token_user_id: Option<String>,
    start_order: Option<Vec<String>>,
    aggregate: Option<String>,
    #[serde(default)]
    timing: RawTiming,
    #[serde(default)]
    services: BTreeMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTiming {
    launch_grace_ms: Option<u64>,
    stop_poll_interval_ms: Option<u64>,
    stop_poll_attempts: Option<u32>,
    restart_pause_ms: Option<u64>,
    follow_poll_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    display_name: Option<String>,
    cmd: Option<Vec<String>>,
    cwd: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
    log: Option<String>,
    pattern: Option<String>,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        Self::load_with(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve settings with an explicit environment lookup.
    pub fn load_with(overrides: &Overrides, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_root = match &overrides.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        if !project_root.is_dir() {
            return Err(Error::Config(format!(
                "project root {} is not a directory",
                project_root.display()
            )));
        }

        let raw = load_raw(&project_root.join(CONFIG_FILE))?;

        let python = overrides
            .python
            .clone()
            .or_else(|| env("BOTCTL_PYTHON"))
            .or_else(|| raw.python.clone())
            .unwrap_or_else(|| default_python(&project_root));

        let env_file = overrides
            .env_file
            .clone()
            .or_else(|| env("BOTCTL_ENV_FILE").map(PathBuf::from))
            .or_else(|| raw.env_file.clone())
            .unwrap_or_else(|| default_env_file(&project_root, env("ENVIRONMENT").as_deref()));

        let mut ports = raw.ports.clone().unwrap_or_else(|| DEFAULT_PORTS.to_vec());
        if let Some(port) = env("OAUTH_PORT").and_then(|p| p.parse::<u16>().ok())
            && raw.ports.is_none()
        {
            ports[0] = port;
        }

        let registry = build_registry(&python, &raw)?;

        Ok(Self {
            pid_dir: resolve(&project_root, raw.pid_dir.as_deref().unwrap_or(Path::new("pids"))),
            log_dir: resolve(&project_root, raw.log_dir.as_deref().unwrap_or(Path::new("logs"))),
            env_file: resolve(&project_root, &env_file),
            python,
            registry,
            timing: raw.timing.into_timing(),
            ports,
            token_user_id: raw
                .token_user_id
                .unwrap_or_else(|| DEFAULT_TOKEN_USER.to_string()),
            project_root,
        })
    }

    /// Settings rooted at `root` with the default registry, for embedding
    /// and tests.
    pub fn with_defaults(root: impl Into<PathBuf>, python: &str) -> Self {
        let project_root = root.into();
        Self {
            pid_dir: project_root.join("pids"),
            log_dir: project_root.join("logs"),
            env_file: project_root.join(".env"),
            python: python.to_string(),
            registry: Registry::defaults(python),
            timing: Timing::default(),
            ports: DEFAULT_PORTS.to_vec(),
            token_user_id: DEFAULT_TOKEN_USER.to_string(),
            project_root,
        }
    }

    pub fn log_path(&self, service: &Service) -> PathBuf {
        self.log_dir.join(&service.log_file)
    }

    /// The launch spec actually executed: the service's command, run from
    /// the project root unless it names a directory, with the env file
    /// sourced when present.
    pub fn effective_launch(&self, service: &Service) -> LaunchSpec {
        let mut spec = service.launch.clone();
        spec.cwd = Some(match spec.cwd.take() {
            Some(dir) => resolve(&self.project_root, &dir),
            None => self.project_root.clone(),
        });
        if self.env_file.is_file() {
            spec.sourcing(&self.env_file)
        } else {
            spec
        }
    }
}

impl RawTiming {
    fn into_timing(self) -> Timing {
        let defaults = Timing::default();
        Timing {
            launch_grace: self
                .launch_grace_ms
                .map_or(defaults.launch_grace, Duration::from_millis),
            stop_poll_interval: self
                .stop_poll_interval_ms
                .map_or(defaults.stop_poll_interval, Duration::from_millis),
            stop_poll_attempts: self
                .stop_poll_attempts
                .unwrap_or(defaults.stop_poll_attempts),
            restart_pause: self
                .restart_pause_ms
                .map_or(defaults.restart_pause, Duration::from_millis),
            follow_poll: self
                .follow_poll_ms
                .map_or(defaults.follow_poll, Duration::from_millis),
        }
    }
}

fn load_raw(path: &Path) -> Result<RawSettings> {
    if !path.exists() {
        return Ok(RawSettings::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("failed to parse config file {}: {e}", path.display()))
    })
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// A project virtualenv wins over the system interpreter.
fn default_python(root: &Path) -> String {
    ["venv/bin/python", ".venv/bin/python"]
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|candidate| candidate.is_file())
        .map_or_else(|| "python3".to_string(), |p| p.to_string_lossy().into_owned())
}

/// `production.env` in production or whenever it exists, `.env` otherwise.
fn default_env_file(root: &Path, environment: Option<&str>) -> PathBuf {
    let production = root.join("production.env");
    if environment.is_some_and(|env| env.trim().eq_ignore_ascii_case("production"))
        || production.is_file()
    {
        production
    } else {
        root.join(".env")
    }
}

fn substitute_python(python: &str, cmd: &[String]) -> Vec<String> {
    cmd.iter()
        .map(|part| part.replace(PYTHON_PLACEHOLDER, python))
        .collect()
}

fn build_registry(python: &str, raw: &RawSettings) -> Result<Registry> {
    let defaults = Registry::defaults(python);
    let mut services: Vec<Service> = defaults.iter().cloned().collect();

    for (id, raw_service) in &raw.services {
        if let Some(existing) = services.iter_mut().find(|s| &s.id == id) {
            raw_service.apply_to(existing, python)?;
            continue;
        }
        let cmd = raw_service
            .cmd
            .as_deref()
            .ok_or_else(|| Error::Config(format!("service `{id}`: cmd is required")))?;
        let launch = LaunchSpec::from_cmd(id, &substitute_python(python, cmd))?;
        let mut service = Service {
            id: id.clone(),
            display_name: id.clone(),
            pattern: launch.command_line(),
            launch,
            log_file: format!("{id}.log"),
        };
        raw_service.apply_to(&mut service, python)?;
        services.push(service);
    }

    Registry::new(
        services,
        raw.start_order
            .clone()
            .unwrap_or_else(|| defaults.start_ids().to_vec()),
        raw.aggregate
            .clone()
            .unwrap_or_else(|| defaults.aggregate_id().to_string()),
    )
}

impl RawService {
    fn apply_to(&self, service: &mut Service, python: &str) -> Result<()> {
        if let Some(name) = &self.display_name {
            service.display_name.clone_from(name);
        }
        if let Some(cmd) = &self.cmd {
            let launch = LaunchSpec::from_cmd(&service.id, &substitute_python(python, cmd))?;
            service.launch.program = launch.program;
            service.launch.args = launch.args;
        }
        if let Some(cwd) = &self.cwd {
            service.launch.cwd = Some(cwd.clone());
        }
        if let Some(env) = &self.env {
            let mut vars: Vec<(String, String)> =
                env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            vars.sort();
            service.launch.env = vars;
        }
        if let Some(log) = &self.log {
            if log.trim().is_empty() || log.contains('/') {
                return Err(Error::Config(format!(
                    "service `{}`: log must be a plain file name",
                    service.id
                )));
            }
            service.log_file.clone_from(log);
        }
        if let Some(pattern) = &self.pattern {
            service.pattern.clone_from(pattern);
        }
        Ok(())
    }
}
