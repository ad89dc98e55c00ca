//! Command dispatch.

use std::io;
use std::process::{ExitCode, Stdio};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use botctl_core::diagnostics::{Diagnostics, collect_diagnostics};
use botctl_core::logs::{self, DEFAULT_TAIL_LINES};
use botctl_core::process::UnixProcesses;
use botctl_core::{Error, LaunchSpec, Overrides, Settings, Supervisor, ports, preflight};

use crate::Command;
use crate::adapter::AppAdapter;
use crate::report;

/// Module run in the foreground by `test`.
const SELF_TEST_MODULE: &str = "twitter_bot.background.scheduler";

type Sup<'a> = Supervisor<'a, UnixProcesses>;

pub fn dispatch(overrides: &Overrides, command: &Command) -> Result<ExitCode> {
    let settings = Settings::load(overrides).context("failed to load botctl settings")?;
    let adapter = AppAdapter::new(&settings);
    run(&settings, &adapter, command)
}

/// Execute `command` and map its outcome to the process exit code.
fn run(settings: &Settings, diagnostics: &dyn Diagnostics, command: &Command) -> Result<ExitCode> {
    let supervisor = Supervisor::new(settings, UnixProcesses::new());
    info!(root = %settings.project_root.display(), ?command, "dispatching");

    match command {
        Command::Start => start_all(&supervisor, diagnostics),
        Command::Stop => {
            report::print(&report::render_stop(&supervisor.stop_all()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Restart => restart(&supervisor, diagnostics),
        Command::Status => {
            status(settings, &supervisor, diagnostics);
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs { service, lines } => follow_logs(settings, service.as_deref(), *lines),
        Command::Oauth => start_one(&supervisor, diagnostics, "oauth"),
        Command::Bot => start_one(&supervisor, diagnostics, "bot"),
        Command::Twitter => start_one(&supervisor, diagnostics, "twitter"),
        Command::Email => start_one(&supervisor, diagnostics, "email"),
        Command::Test => run_foreground(&self_test_spec(settings)?),
    }
}

/// Report text for the failures a command reports itself rather than
/// propagating.
fn failure_text(err: &Error) -> Option<String> {
    match err {
        Error::ValidationFailed(_) => Some(format!("{err}\nNothing was started.\n")),
        Error::LaunchFailed { log, .. } => {
            let mut text = format!("{err}\n");
            match logs::last_lines(log, DEFAULT_TAIL_LINES) {
                Ok(lines) if !lines.is_empty() => {
                    text.push_str("Last log lines:\n");
                    for line in lines {
                        text.push_str(&format!("  {line}\n"));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(log = %log.display(), error = %e, "cannot read launch log"),
            }
            Some(text)
        }
        _ => None,
    }
}

/// Print a validation or launch failure; anything else is propagated.
fn report_failure(settings: &Settings, err: Error) -> Result<ExitCode> {
    if let Some(text) = failure_text(&err) {
        report::print(&text);
        return Ok(ExitCode::FAILURE);
    }
    warn!(root = %settings.project_root.display(), "supervisor operation failed");
    Err(err.into())
}

fn print_started(sup: &Sup<'_>, started: &[(String, u32)]) {
    let registry = &sup.settings().registry;
    let mut text = String::new();
    for (id, pid) in started {
        let name = registry.get(id).map_or(id.as_str(), |s| s.display_name.as_str());
        text.push_str(&format!("  {name} running (pid {pid})\n"));
    }
    report::print(&text);
}

fn start_all(sup: &Sup<'_>, diagnostics: &dyn Diagnostics) -> Result<ExitCode> {
    if let Err(e) = preflight::validate(sup.settings(), diagnostics) {
        return report_failure(sup.settings(), e);
    }
    let cleared = sup.stop_all();
    if cleared.stopped_anything() {
        report::print(&report::render_stop(&cleared));
    }
    match sup.start_all() {
        Ok(started) => {
            print_started(sup, &started);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_failure(sup.settings(), e),
    }
}

fn start_one(sup: &Sup<'_>, diagnostics: &dyn Diagnostics, service_id: &str) -> Result<ExitCode> {
    if let Err(e) = preflight::validate(sup.settings(), diagnostics) {
        return report_failure(sup.settings(), e);
    }
    match sup.start(service_id) {
        Ok(pid) => {
            print_started(sup, &[(service_id.to_string(), pid)]);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_failure(sup.settings(), e),
    }
}

/// Validation runs first so a broken configuration never takes running
/// services down.
fn restart(sup: &Sup<'_>, diagnostics: &dyn Diagnostics) -> Result<ExitCode> {
    if let Err(e) = preflight::validate(sup.settings(), diagnostics) {
        return report_failure(sup.settings(), e);
    }
    match sup.restart() {
        Ok((stopped, started)) => {
            report::print(&report::render_stop(&stopped));
            print_started(sup, &started);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_failure(sup.settings(), e),
    }
}

fn status(settings: &Settings, sup: &Sup<'_>, diagnostics: &dyn Diagnostics) {
    let services = sup.status();
    let listeners = ports::listening(&settings.ports);
    let lines = collect_diagnostics(
        diagnostics,
        &settings.token_user_id,
        Local::now().naive_local(),
    );
    report::print(&report::render_status(
        &services,
        &settings.ports,
        &listeners,
        &lines,
    ));
}

/// Blocks until interrupted; SIGINT's default action ends the process and
/// nothing is left half-written.
fn follow_logs(settings: &Settings, service: Option<&str>, lines: usize) -> Result<ExitCode> {
    let mut stdout = io::stdout().lock();
    match logs::tail_logs(settings, service, lines, &mut stdout, || true) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(Error::LogNotFound { path, available }) => {
            drop(stdout);
            report::print(&report::render_missing_log(&path, &available));
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("failed to follow log"),
    }
}

/// The application's test cycle, run from the project root with the
/// environment file exported when present.
fn self_test_spec(settings: &Settings) -> Result<LaunchSpec> {
    let mut spec = LaunchSpec::from_cmd(
        "test",
        &[
            settings.python.clone(),
            "-m".to_string(),
            SELF_TEST_MODULE.to_string(),
            "--test".to_string(),
        ],
    )?;
    spec.cwd = Some(settings.project_root.clone());
    if settings.env_file.is_file() {
        spec = spec.sourcing(&settings.env_file);
    }
    Ok(spec)
}

/// Run `spec` in the foreground and pass its exit code through.
fn run_foreground(spec: &LaunchSpec) -> Result<ExitCode> {
    info!(command = %spec.command_line(), "running in foreground");
    let status = spec
        .command()
        .stdin(Stdio::inherit())
        .status()
        .with_context(|| format!("failed to run {}", spec.command_line()))?;
    // Killed by a signal: no code to pass through.
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
