//! Human-readable reports on stdout.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use botctl_core::diagnostics::{DiagnosticError, DiagnosticLine};
use botctl_core::ports::Listener;
use botctl_core::{ServiceStatus, StopAllReport, StopOutcome};

pub fn render_status(
    services: &[ServiceStatus],
    ports: &[u16],
    listeners: &Result<Vec<Listener>, DiagnosticError>,
    diagnostics: &[DiagnosticLine],
) -> String {
    let mut out = String::from("Services\n");
    for s in services {
        let state = match (s.running, s.pid) {
            (true, Some(pid)) => format!("running (pid {pid})"),
            (true, None) => "running".to_string(),
            (false, _) => "stopped".to_string(),
        };
        let _ = writeln!(out, "  {:<22} {:<8} {state}", s.display_name, s.id);
    }

    out.push_str("\nListeners\n");
    match listeners {
        Ok(found) => {
            for port in ports {
                let addrs: Vec<String> = found
                    .iter()
                    .filter(|l| l.port == *port)
                    .map(|l| l.address.to_string())
                    .collect();
                if addrs.is_empty() {
                    let _ = writeln!(out, "  {port:<6} not listening");
                } else {
                    let _ = writeln!(out, "  {port:<6} listening on {}", addrs.join(", "));
                }
            }
        }
        Err(e) => {
            let _ = writeln!(out, "  unavailable ({e})");
        }
    }

    out.push_str("\nApplication\n");
    for line in diagnostics {
        let _ = writeln!(out, "  {line}");
    }
    out
}

pub fn render_stop(report: &StopAllReport) -> String {
    let mut out = String::new();
    for (id, outcome) in &report.services {
        let detail = match outcome {
            StopOutcome::NotRunning => "not running".to_string(),
            StopOutcome::Terminated { pid } => format!("stopped (pid {pid})"),
            StopOutcome::Killed { pid } => format!("killed after timeout (pid {pid})"),
            StopOutcome::Survived { pid } => {
                format!("signalled but still present (pid {pid}); pid file removed")
            }
        };
        let _ = writeln!(out, "  {id:<8} {detail}");
    }
    if !report.swept.is_empty() {
        let pids: Vec<String> = report.swept.iter().map(u32::to_string).collect();
        let _ = writeln!(out, "  killed untracked processes: {}", pids.join(", "));
    }
    out
}

pub fn render_missing_log(path: &Path, available: &[PathBuf]) -> String {
    let mut out = format!("No log file at {}\n", path.display());
    if available.is_empty() {
        out.push_str("No log files exist yet.\n");
    } else {
        out.push_str("Available logs:\n");
        for log in available {
            let name = log.file_name().map_or_else(
                || log.display().to_string(),
                |n| n.to_string_lossy().into_owned(),
            );
            let _ = writeln!(out, "  {name}");
        }
    }
    out
}

#[allow(clippy::print_stdout)]
pub fn print(text: &str) {
    print!("{text}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn svc(id: &str, name: &str, pid: Option<u32>) -> ServiceStatus {
        ServiceStatus {
            id: id.into(),
            display_name: name.into(),
            running: pid.is_some(),
            pid,
        }
    }

    #[test]
    fn status_lists_services_ports_and_diagnostics() {
        let services = [svc("oauth", "OAuth Server", Some(4242)), svc("bot", "Automation Scheduler", None)];
        let listeners = Ok(vec![Listener {
            port: 8000,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }]);
        let diagnostics = [DiagnosticLine {
            label: "API usage",
            detail: "unavailable (api_usage.json not found)".into(),
            degraded: true,
        }];
        let text = render_status(&services, &[8000, 8080], &listeners, &diagnostics);

        assert!(text.contains("OAuth Server"));
        assert!(text.contains("running (pid 4242)"));
        assert!(text.lines().any(|l| l.contains("Automation Scheduler") && l.ends_with("stopped")));
        assert!(text.contains("8000   listening on 0.0.0.0"));
        assert!(text.contains("8080   not listening"));
        assert!(text.contains("API usage:       unavailable (api_usage.json not found)"));
    }

    #[test]
    fn status_survives_missing_listener_table() {
        let listeners = Err(DiagnosticError::Unavailable("no /proc".into()));
        let text = render_status(&[], &[8000], &listeners, &[]);
        assert!(text.contains("unavailable (no /proc)"));
    }

    #[test]
    fn stop_report_names_each_outcome_and_sweep() {
        let report = StopAllReport {
            services: vec![
                ("oauth".into(), StopOutcome::Terminated { pid: 10 }),
                ("bot".into(), StopOutcome::Killed { pid: 11 }),
                ("email".into(), StopOutcome::NotRunning),
            ],
            swept: vec![12, 13],
        };
        let text = render_stop(&report);
        assert!(text.contains("stopped (pid 10)"));
        assert!(text.contains("killed after timeout (pid 11)"));
        assert!(text.contains("email    not running"));
        assert!(text.contains("killed untracked processes: 12, 13"));
    }

    #[test]
    fn missing_log_lists_file_names() {
        let text = render_missing_log(
            Path::new("/srv/logs/email.log"),
            &[PathBuf::from("/srv/logs/oauth.log")],
        );
        assert_eq!(
            text,
            "No log file at /srv/logs/email.log\nAvailable logs:\n  oauth.log\n"
        );
        assert!(render_missing_log(Path::new("x.log"), &[]).contains("No log files exist yet"));
    }
}
