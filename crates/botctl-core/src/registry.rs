//! Fixed registry of supervised services.
//!
//! The registry is built once from defaults and `botctl.toml` and is
//! read-only afterwards. Enumeration follows declaration order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// Id of the aggregate service in the default registry.
pub const AGGREGATE_ID: &str = "bot";

/// Extra names accepted for the aggregate service by `logs`.
const AGGREGATE_ALIASES: &[&str] = &["scheduler", "background_scheduler"];

/// Shell program used to source the env file before exec-ing a service.
const SHELL: &str = "sh";

/// Sources the file in `$0` with auto-export on, then replaces itself with
/// the command in `$@`. The pid therefore stays the service's pid.
const SOURCE_AND_EXEC: &str = "set -a; . \"$0\"; set +a; exec \"$@\"";

/// What to run for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Build a spec from an argv-style command.
    pub fn from_cmd(name: &str, cmd: &[String]) -> Result<Self> {
        let Some((program, args)) = cmd.split_first() else {
            return Err(Error::Config(format!("service `{name}`: cmd is empty")));
        };
        if cmd.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Config(format!(
                "service `{name}`: cmd contains empty element"
            )));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
            env: Vec::new(),
        })
    }

    /// The command line as a single string, for logs and reports.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A [`Command`] with program, arguments, working directory and extra
    /// environment applied. Stdio is left to the caller.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    /// Wrap the command so `env_file` is exported into its environment.
    ///
    /// The file content is handed to `sh` untouched.
    #[must_use]
    pub fn sourcing(&self, env_file: &Path) -> Self {
        let mut args = vec![
            "-c".to_string(),
            SOURCE_AND_EXEC.to_string(),
            env_file.to_string_lossy().into_owned(),
            self.program.clone(),
        ];
        args.extend(self.args.iter().cloned());
        Self {
            program: SHELL.to_string(),
            args,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// A named long-running unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Stable short identifier, also the pid file stem.
    pub id: String,
    pub display_name: String,
    pub launch: LaunchSpec,
    /// File name inside the log directory.
    pub log_file: String,
    /// Command-line substring matched by the stop-all sweep.
    pub pattern: String,
}

impl Service {
    fn python_module(
        id: &str,
        display_name: &str,
        python: &str,
        module: &str,
        extra: &[&str],
    ) -> Self {
        let mut args = vec!["-m".to_string(), module.to_string()];
        args.extend(extra.iter().map(|a| (*a).to_string()));
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            launch: LaunchSpec {
                program: python.to_string(),
                args,
                cwd: None,
                env: Vec::new(),
            },
            log_file: format!("{id}.log"),
            pattern: module.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<Service>,
    start_order: Vec<String>,
    aggregate: String,
}

impl Registry {
    /// Build a registry, checking that ids are unique and that the start
    /// order and aggregate id refer to registered services.
    pub fn new(
        services: Vec<Service>,
        start_order: Vec<String>,
        aggregate: String,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for service in &services {
            if !seen.insert(service.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate service id `{}`",
                    service.id
                )));
            }
            if service.pattern.trim().is_empty() {
                return Err(Error::Config(format!(
                    "service `{}`: sweep pattern is empty",
                    service.id
                )));
            }
        }
        for id in start_order.iter().chain(std::iter::once(&aggregate)) {
            if !seen.contains(id.as_str()) {
                return Err(Error::Config(format!("`{id}` is not a registered service")));
            }
        }
        Ok(Self {
            services,
            start_order,
            aggregate,
        })
    }

    /// The automation application's services, launched with `python`.
    pub fn defaults(python: &str) -> Self {
        let oauth = Service::python_module(
            "oauth",
            "OAuth Server",
            python,
            "twitter_bot.integrations.oauth_server",
            &[],
        );
        let mut bot = Service::python_module(
            AGGREGATE_ID,
            "Automation Scheduler",
            python,
            "twitter_bot.background.scheduler",
            &[],
        );
        // The scheduler has always written here, whatever the service is called.
        bot.log_file = "background_scheduler.log".to_string();
        let twitter = Service::python_module(
            "twitter",
            "Twitter Bot",
            python,
            "twitter_bot.background.scheduler",
            &["--no-email"],
        );
        let email = Service::python_module(
            "email",
            "Email Pipeline",
            python,
            "twitter_bot.background.scheduler",
            &["--no-twitter"],
        );

        Self {
            services: vec![oauth, bot, twitter, email],
            start_order: vec!["oauth".to_string(), AGGREGATE_ID.to_string()],
            aggregate: AGGREGATE_ID.to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::UnknownService(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services launched by `start`, in launch order.
    pub fn start_order(&self) -> impl Iterator<Item = &Service> {
        self.start_order.iter().filter_map(|id| self.get(id).ok())
    }

    pub fn aggregate(&self) -> Result<&Service> {
        self.get(&self.aggregate)
    }

    /// Map a name given to `logs` onto a registered service, honouring the
    /// aggregate aliases. `None` means the aggregate service.
    pub fn lookup_log_target(&self, name: Option<&str>) -> Option<&Service> {
        match name {
            None => self.aggregate().ok(),
            Some(name) if AGGREGATE_ALIASES.contains(&name) => self.aggregate().ok(),
            Some(name) => self.get(name).ok(),
        }
    }

    /// Distinct sweep patterns, in registry order.
    pub fn patterns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.services
            .iter()
            .map(|s| s.pattern.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    pub fn start_ids(&self) -> &[String] {
        &self.start_order
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_launch_oauth_before_aggregate() {
        let registry = Registry::defaults("python3");
        let order: Vec<_> = registry.start_order().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["oauth", "bot"]);
    }

    #[test]
    fn aggregate_keeps_legacy_log_name() {
        let registry = Registry::defaults("python3");
        let bot = registry.aggregate().unwrap();
        assert_eq!(bot.log_file, "background_scheduler.log");
        assert_eq!(registry.get("oauth").unwrap().log_file, "oauth.log");
    }

    #[test]
    fn log_target_aliases_resolve_to_aggregate() {
        let registry = Registry::defaults("python3");
        for name in [None, Some("bot"), Some("scheduler")] {
            assert_eq!(registry.lookup_log_target(name).unwrap().id, "bot");
        }
        assert!(registry.lookup_log_target(Some("nope")).is_none());
    }

    #[test]
    fn patterns_are_deduplicated() {
        let registry = Registry::defaults("python3");
        assert_eq!(
            registry.patterns(),
            vec![
                "twitter_bot.integrations.oauth_server",
                "twitter_bot.background.scheduler"
            ]
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let svc = Registry::defaults("python3").get("oauth").unwrap().clone();
        let err = Registry::new(vec![svc.clone(), svc], vec![], "oauth".into()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn start_order_must_reference_services() {
        let svc = Registry::defaults("python3").get("oauth").unwrap().clone();
        assert!(Registry::new(vec![svc], vec!["ghost".into()], "oauth".into()).is_err());
    }

    #[test]
    fn from_cmd_rejects_empty_elements() {
        assert!(LaunchSpec::from_cmd("x", &[]).is_err());
        assert!(LaunchSpec::from_cmd("x", &["echo".into(), " ".into()]).is_err());
        let spec = LaunchSpec::from_cmd("x", &["echo".into(), "hi".into()]).unwrap();
        assert_eq!(spec.command_line(), "echo hi");
    }

    #[test]
    fn sourcing_wraps_command_in_shell() {
        let spec = LaunchSpec::from_cmd("x", &["python3".into(), "-m".into(), "app".into()]).unwrap();
        let wrapped = spec.sourcing(Path::new("/srv/app/.env"));
        assert_eq!(wrapped.program, "sh");
        assert_eq!(
            wrapped.args,
            vec!["-c", SOURCE_AND_EXEC, "/srv/app/.env", "python3", "-m", "app"]
        );
    }
}
