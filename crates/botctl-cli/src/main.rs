//! botctl
//!
//! Starts, stops and monitors the automation services as detached
//! background processes tracked by pid files.

mod adapter;
mod commands;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use botctl_core::Overrides;
use botctl_core::logs::DEFAULT_TAIL_LINES;

#[derive(Debug, Parser)]
#[command(name = "botctl", version, about = "Supervise the automation services")]
struct Cli {
    /// Project root holding the application, its env file, pids/ and logs/
    #[arg(long, global = true, env = "BOTCTL_PROJECT_ROOT")]
    root: Option<PathBuf>,

    /// Environment file exported into every service
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Validate, clear stragglers, then start the OAuth server and scheduler
    Start,
    /// Stop every service and sweep untracked service processes
    Stop,
    /// Stop everything, pause, then start again
    Restart,
    /// Show service state, listeners and application diagnostics
    Status,
    /// Follow a service log (default: the scheduler)
    Logs {
        /// Service id or alias
        service: Option<String>,

        /// Lines of history to print before following
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
    },
    /// Start only the OAuth callback server
    Oauth,
    /// Start only the aggregate scheduler
    Bot,
    /// Start only the Twitter half of the scheduler
    Twitter,
    /// Start only the email pipeline
    Email,
    /// Run one scheduler test cycle in the foreground
    Test,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    botctl_core::tracing_init::init_tracing("warn", cli.log_json);

    let overrides = Overrides {
        root: cli.root,
        env_file: cli.env_file,
        python: None,
    };
    match commands::dispatch(&overrides, &cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
