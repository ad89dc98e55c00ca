//! Supervisor operations over the registry and the pid store.
//!
//! Every operation is synchronous and meant for a short-lived invocation:
//! state between invocations lives only in pid files and logs.
//!
//! Per-service lifecycle:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//!               |
//!               +-> STOPPED (launch failed)
//! ```
//!
//! A pid file whose process is gone (stale) reads as STOPPED and is removed
//! by the next liveness check.

use std::thread;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::pidfile::PidStore;
use crate::process::{ProcessControl, Termination};

/// One line of the status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub id: String,
    pub display_name: String,
    pub running: bool,
    pub pid: Option<u32>,
}

/// What `stop` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live process was recorded.
    NotRunning,
    /// Exited after the graceful signal.
    Terminated { pid: u32 },
    /// Needed the forced signal.
    Killed { pid: u32 },
    /// Still present after the forced signal. The pid file is gone anyway.
    Survived { pid: u32 },
}

/// Result of stopping every service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopAllReport {
    /// Per-service outcomes, in registry order.
    pub services: Vec<(String, StopOutcome)>,
    /// Processes found by the command-line sweep and force-killed.
    pub swept: Vec<u32>,
}

impl StopAllReport {
    /// Whether any process was signalled.
    pub fn stopped_anything(&self) -> bool {
        !self.swept.is_empty()
            || self
                .services
                .iter()
                .any(|(_, outcome)| *outcome != StopOutcome::NotRunning)
    }
}

pub struct Supervisor<'a, P: ProcessControl> {
    settings: &'a Settings,
    pids: PidStore,
    procs: P,
}

impl<'a, P: ProcessControl> Supervisor<'a, P> {
    pub fn new(settings: &'a Settings, procs: P) -> Self {
        Self {
            settings,
            pids: PidStore::new(&settings.pid_dir),
            procs,
        }
    }

    pub const fn settings(&self) -> &'a Settings {
        self.settings
    }

    pub const fn pid_store(&self) -> &PidStore {
        &self.pids
    }

    pub const fn process_control(&self) -> &P {
        &self.procs
    }

    /// Pid of the live process recorded for `service_id`.
    ///
    /// A record pointing at no live process, or holding garbage, is deleted
    /// and reported as `None`.
    pub fn running_pid(&self, service_id: &str) -> Result<Option<u32>> {
        let service = self.settings.registry.get(service_id)?;
        let pid = match self.pids.read(&service.id) {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(None),
            Err(Error::InvalidPidFile { path, contents }) => {
                warn!(
                    service = %service.id,
                    path = %path.display(),
                    ?contents,
                    "discarding unreadable pid file"
                );
                self.pids.remove(&service.id)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.procs.is_alive(pid) {
            Ok(Some(pid))
        } else {
            debug!(service = %service.id, pid, "reclaiming stale pid file");
            self.pids.remove(&service.id)?;
            Ok(None)
        }
    }

    pub fn is_running(&self, service_id: &str) -> Result<bool> {
        Ok(self.running_pid(service_id)?.is_some())
    }

    /// Launch a service unless it is already running.
    ///
    /// Returns the existing pid when a live process is recorded. Otherwise the
    /// new process must still be alive after the launch grace period.
    pub fn start(&self, service_id: &str) -> Result<u32> {
        let service = self.settings.registry.get(service_id)?;
        if let Some(pid) = self.running_pid(&service.id)? {
            info!(service = %service.id, pid, "already running");
            return Ok(pid);
        }

        let log = self.settings.log_path(service);
        let spec = self.settings.effective_launch(service);
        let pid = self.procs.spawn_detached(&spec, &log)?;
        if let Err(e) = self.pids.write(&service.id, pid) {
            // Unrecorded, the process could only be found by a sweep.
            warn!(service = %service.id, pid, error = %e, "cannot record pid; killing new process");
            if let Err(kill_err) = self.procs.signal(pid, Termination::Forced) {
                warn!(
                    service = %service.id,
                    pid,
                    error = %kill_err,
                    "kill of unrecorded process failed"
                );
            }
            return Err(e);
        }
        info!(service = %service.id, pid, "launched; waiting out grace period");

        thread::sleep(self.settings.timing.launch_grace);

        if self.procs.is_alive(pid) {
            info!(service = %service.id, pid, "running");
            Ok(pid)
        } else {
            warn!(service = %service.id, pid, log = %log.display(), "exited during grace period");
            self.pids.remove(&service.id)?;
            Err(Error::LaunchFailed {
                service: service.display_name.clone(),
                pid,
                log,
            })
        }
    }

    /// Launch the services of the start order, in order. Stops at the first
    /// failure since later services may rely on earlier ones.
    pub fn start_all(&self) -> Result<Vec<(String, u32)>> {
        let mut started = Vec::new();
        for service in self.settings.registry.start_order() {
            let pid = self.start(&service.id)?;
            started.push((service.id.clone(), pid));
        }
        Ok(started)
    }

    /// Terminate a service: graceful signal, bounded polling, then forced
    /// signal. The pid file is removed whatever happens.
    pub fn stop(&self, service_id: &str) -> Result<StopOutcome> {
        let Some(pid) = self.running_pid(service_id)? else {
            debug!(service = service_id, "not running");
            return Ok(StopOutcome::NotRunning);
        };

        info!(service = service_id, pid, "sending graceful termination");
        if let Err(e) = self.procs.signal(pid, Termination::Graceful) {
            warn!(service = service_id, pid, error = %e, "graceful signal failed");
        }

        let outcome = if self.wait_for_exit(pid) {
            info!(service = service_id, pid, "stopped");
            StopOutcome::Terminated { pid }
        } else {
            warn!(
                service = service_id,
                pid,
                attempts = self.settings.timing.stop_poll_attempts,
                "still alive; forcing"
            );
            if let Err(e) = self.procs.signal(pid, Termination::Forced) {
                warn!(service = service_id, pid, error = %e, "forced signal failed");
            }
            thread::sleep(self.settings.timing.stop_poll_interval);
            if self.procs.is_alive(pid) {
                warn!(service = service_id, pid, "process survived forced termination");
                StopOutcome::Survived { pid }
            } else {
                StopOutcome::Killed { pid }
            }
        };

        if let Err(e) = self.pids.remove(service_id) {
            warn!(service = service_id, error = %e, "failed to remove pid file");
        }
        Ok(outcome)
    }

    fn wait_for_exit(&self, pid: u32) -> bool {
        let timing = &self.settings.timing;
        for _ in 0..timing.stop_poll_attempts {
            thread::sleep(timing.stop_poll_interval);
            if !self.procs.is_alive(pid) {
                return true;
            }
        }
        false
    }

    /// Stop every registered service, then force-kill any process whose
    /// command line matches a service's sweep pattern.
    ///
    /// The sweep catches services whose pid file was lost. Matching is by
    /// substring, so an unrelated process with a matching command line is
    /// killed too.
    pub fn stop_all(&self) -> StopAllReport {
        let mut report = StopAllReport::default();
        for service in self.settings.registry.iter() {
            let outcome = self.stop(&service.id).unwrap_or_else(|e| {
                warn!(service = %service.id, error = %e, "stop failed");
                StopOutcome::NotRunning
            });
            report.services.push((service.id.clone(), outcome));
        }

        let patterns = self.settings.registry.patterns();
        for pid in self.procs.find_by_pattern(&patterns) {
            warn!(pid, "killing untracked service process");
            if let Err(e) = self.procs.signal(pid, Termination::Forced) {
                warn!(pid, error = %e, "sweep kill failed");
                continue;
            }
            report.swept.push(pid);
        }
        report
    }

    /// Stop everything, pause, then start the default services.
    pub fn restart(&self) -> Result<(StopAllReport, Vec<(String, u32)>)> {
        let stopped = self.stop_all();
        thread::sleep(self.settings.timing.restart_pause);
        let started = self.start_all()?;
        Ok((stopped, started))
    }

    /// One entry per registered service, in registry order.
    ///
    /// Not read-only: stale pid files found on the way are removed.
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.settings
            .registry
            .iter()
            .map(|service| {
                let pid = self.running_pid(&service.id).unwrap_or_else(|e| {
                    warn!(service = %service.id, error = %e, "liveness check failed");
                    None
                });
                ServiceStatus {
                    id: service.id.clone(),
                    display_name: service.display_name.clone(),
                    running: pid.is_some(),
                    pid,
                }
            })
            .collect()
    }
}
