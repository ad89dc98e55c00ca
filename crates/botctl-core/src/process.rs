//! Operating-system process control.
//!
//! [`ProcessControl`] is the seam between the supervisor and the OS so the
//! supervisor can be driven against a fake in tests. [`UnixProcesses`] is the
//! real implementation.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgid};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, RefreshKind, System, UpdateKind};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::LaunchSpec;

/// How hard to ask a process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM: the process may clean up, or ignore it.
    Graceful,
    /// SIGKILL: cannot be caught or ignored.
    Forced,
}

impl Termination {
    const fn signal(self) -> Signal {
        match self {
            Self::Graceful => Signal::SIGTERM,
            Self::Forced => Signal::SIGKILL,
        }
    }
}

pub trait ProcessControl {
    /// Launch `spec` detached from the caller, appending stdout and stderr to
    /// `log`. Returns the new pid.
    fn spawn_detached(&self, spec: &LaunchSpec, log: &Path) -> Result<u32>;

    /// Non-destructive liveness probe.
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver a termination signal. A process that is already gone is not
    /// an error.
    fn signal(&self, pid: u32, how: Termination) -> Result<()>;

    /// Pids whose command line contains any of `patterns`, excluding the
    /// calling process.
    fn find_by_pattern(&self, patterns: &[&str]) -> Vec<u32>;
}

/// Process control through `nix` signals and a `sysinfo` process table scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcesses;

impl UnixProcesses {
    pub const fn new() -> Self {
        Self
    }
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| Error::Signal(Errno::EINVAL))
}

fn is_zombie(pid: u32) -> bool {
    let pid = SysPid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
        return false;
    }
    let zombie = sys
        .process(pid)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie);
    if zombie {
        debug!(%pid, "process is a zombie");
    }
    zombie
}

impl ProcessControl for UnixProcesses {
    // The child is reaped by a later `is_alive` call, or by init once this
    // invocation exits.
    #[allow(clippy::zombie_processes)]
    fn spawn_detached(&self, spec: &LaunchSpec, log: &Path) -> Result<u32> {
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = OpenOptions::new().create(true).append(true).open(log)?;
        writeln!(
            out,
            "--- {} starting: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            spec.command_line()
        )?;
        let err = out.try_clone()?;

        let child = spec
            .command()
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            // Own process group: terminal signals to the launcher do not
            // reach the service, and the group can be signalled as a whole.
            .process_group(0)
            .spawn()?;
        let pid = child.id();
        info!(pid, command = %spec.command_line(), log = %log.display(), "spawned detached process");
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        // Our own exited children linger as zombies until reaped, and a
        // signal-0 probe reports zombies as alive.
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return true,
            Ok(status) => {
                debug!(pid, ?status, "reaped exited child");
                return false;
            }
            Err(_) => {}
        }
        match kill(target, None) {
            // Someone else's zombie also answers signal 0 until its parent
            // reaps it.
            Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, how: Termination) -> Result<()> {
        let target = to_pid(pid)?;
        let sig = how.signal();
        // Services run as process-group leaders; signal the whole group so
        // their children go too. Pids recorded by other tools may not lead a
        // group, so fall back to the single process.
        let result = match getpgid(Some(target)) {
            Ok(pgid) if pgid == target => killpg(target, sig),
            _ => kill(target, sig),
        };
        match result {
            Ok(()) => {
                debug!(pid, signal = %sig, "signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, signal = %sig, "process already gone");
                Ok(())
            }
            Err(e) => {
                warn!(pid, signal = %sig, error = %e, "failed to send signal");
                Err(e.into())
            }
        }
    }

    fn find_by_pattern(&self, patterns: &[&str]) -> Vec<u32> {
        if patterns.is_empty() {
            return Vec::new();
        }
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_processes(ProcessRefreshKind::new().with_cmd(UpdateKind::Always)),
        );
        let own = std::process::id();
        let mut pids: Vec<u32> = sys
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own && process.status() != ProcessStatus::Zombie
            })
            .filter(|(_, process)| {
                let cmdline = process.cmd().join(" ");
                patterns.iter().any(|pattern| cmdline.contains(pattern))
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sleeper(secs: &str) -> LaunchSpec {
        LaunchSpec::from_cmd("sleeper", &["sleep".to_string(), secs.to_string()]).unwrap()
    }

    #[test]
    fn spawned_process_is_alive_until_killed() {
        let dir = tempfile::tempdir().unwrap();
        let procs = UnixProcesses::new();
        let pid = procs
            .spawn_detached(&sleeper("30"), &dir.path().join("logs/sleeper.log"))
            .unwrap();
        assert!(procs.is_alive(pid));

        procs.signal(pid, Termination::Forced).unwrap();
        for _ in 0..50 {
            if !procs.is_alive(pid) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!procs.is_alive(pid));
    }

    #[test]
    fn spawn_appends_header_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("sleeper.log");
        fs::write(&log, "earlier line\n").unwrap();
        let procs = UnixProcesses::new();
        let pid = procs.spawn_detached(&sleeper("0"), &log).unwrap();
        let contents = fs::read_to_string(&log).unwrap();
        assert!(contents.starts_with("earlier line\n"));
        assert!(contents.contains("starting: sleep 0"));
        procs.signal(pid, Termination::Forced).unwrap();
    }

    #[test]
    fn spawn_of_missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec =
            LaunchSpec::from_cmd("ghost", &["/nonexistent/botctl-ghost".to_string()]).unwrap();
        let result = UnixProcesses::new().spawn_detached(&spec, &dir.path().join("ghost.log"));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn unknown_pid_is_not_alive_and_signal_tolerates_it() {
        let procs = UnixProcesses::new();
        // Above the largest pid_max Linux allows, never allocated.
        let pid = 4_194_404;
        assert!(!procs.is_alive(pid));
        procs.signal(pid, Termination::Graceful).unwrap();
    }

    /// A pid left unreaped by a parent that never waits: `sh` starts a child
    /// that exits at once, then replaces itself with `sleep`.
    fn orphaned_zombie() -> (std::process::Child, u32) {
        use std::io::{BufRead, BufReader};
        let mut parent = std::process::Command::new("sh")
            .args(["-c", "sh -c 'echo $$' & exec sleep 30"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(parent.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let pid: u32 = line.trim().parse().unwrap();
        let stat = format!("/proc/{pid}/stat");
        for _ in 0..100 {
            let state = fs::read_to_string(&stat).unwrap_or_default();
            if state.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')) {
                return (parent, pid);
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("child {pid} never became a zombie");
    }

    #[test]
    fn zombie_of_another_parent_is_not_alive() {
        let (mut parent, zombie) = orphaned_zombie();
        let procs = UnixProcesses::new();
        assert!(!procs.is_alive(zombie));
        assert!(procs.is_alive(parent.id()));
        parent.kill().unwrap();
        parent.wait().unwrap();
    }

    #[test]
    fn empty_patterns_match_nothing() {
        assert!(UnixProcesses::new().find_by_pattern(&[]).is_empty());
    }
}
