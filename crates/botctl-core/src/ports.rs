//! Which of the well-known ports have a listening socket, read from the
//! kernel's TCP tables.

use std::net::IpAddr;
use std::path::Path;

use procfs::net::{TcpNetEntries, TcpState};
use procfs::{FromReadSI, ProcError, current_system_info};

use crate::diagnostics::DiagnosticError;

const TCP4_TABLE: &str = "/proc/net/tcp";
const TCP6_TABLE: &str = "/proc/net/tcp6";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Listener {
    pub port: u16,
    pub address: IpAddr,
}

/// Listening sockets on any of `ports`, sorted by port.
pub fn listening(ports: &[u16]) -> Result<Vec<Listener>, DiagnosticError> {
    listening_in(&[Path::new(TCP4_TABLE), Path::new(TCP6_TABLE)], ports)
}

/// Like [`listening`], reading the given table files. A missing table is
/// skipped; if every table is missing the probe is unavailable.
pub fn listening_in(tables: &[&Path], ports: &[u16]) -> Result<Vec<Listener>, DiagnosticError> {
    let mut found = Vec::new();
    let mut readable = 0usize;
    for table in tables {
        let entries = match TcpNetEntries::from_file(table, current_system_info()) {
            Ok(entries) => entries,
            Err(ProcError::NotFound(_)) => continue,
            Err(e) => {
                return Err(DiagnosticError::Malformed {
                    path: table.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };
        readable += 1;
        found.extend(
            entries
                .0
                .iter()
                .filter(|entry| matches!(entry.state, TcpState::Listen))
                .filter(|entry| ports.contains(&entry.local_address.port()))
                .map(|entry| Listener {
                    port: entry.local_address.port(),
                    address: entry.local_address.ip(),
                }),
        );
    }
    if readable == 0 {
        return Err(DiagnosticError::Unavailable(
            "TCP socket tables not available on this system".to_string(),
        ));
    }
    found.sort();
    found.dedup();
    Ok(found)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::fs;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::path::PathBuf;

    use super::*;

    /// The kernel prints each 32-bit word of an address in host byte order.
    fn word(octets: [u8; 4]) -> String {
        format!("{:08X}", u32::from_ne_bytes(octets))
    }

    fn table(rows: &[(String, u16, &str)]) -> String {
        let mut out = String::from(
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
        );
        for (i, (addr, port, state)) in rows.iter().enumerate() {
            let remote = if addr.len() == 8 { "00000000" } else { "00000000000000000000000000000000" };
            out.push_str(&format!(
                "   {i}: {addr}:{port:04X} {remote}:0000 {state} 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0\n",
                1000 + i
            ));
        }
        out
    }

    fn write_table(dir: &Path, name: &str, rows: &[(String, u16, &str)]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, table(rows)).unwrap();
        path
    }

    #[test]
    fn keeps_only_listening_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = write_table(
            dir.path(),
            "tcp",
            &[
                (word([127, 0, 0, 1]), 8000, "0A"),
                (word([0, 0, 0, 0]), 8080, "0A"),
                (word([10, 0, 0, 2]), 8000, "01"),
            ],
        );
        let listeners = listening_in(&[&tcp], &[8000, 8080]).unwrap();
        assert_eq!(
            listeners,
            vec![
                Listener {
                    port: 8000,
                    address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                },
                Listener {
                    port: 8080,
                    address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                },
            ]
        );
    }

    #[test]
    fn reads_ipv6_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let tcp6 = write_table(dir.path(), "tcp6", &[("0".repeat(32), 8080, "0A")]);
        let listeners = listening_in(&[&tcp6], &[8080]).unwrap();
        assert_eq!(listeners[0].address, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn filters_to_requested_ports_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = write_table(
            dir.path(),
            "tcp",
            &[
                (word([0, 0, 0, 0]), 8000, "0A"),
                (word([0, 0, 0, 0]), 22, "0A"),
            ],
        );
        let tcp6 = write_table(dir.path(), "tcp6", &[("0".repeat(32), 8080, "0A")]);

        let found = listening_in(&[&tcp, &tcp6], &[8000, 8080]).unwrap();
        let ports: Vec<u16> = found.iter().map(|l| l.port).collect();
        assert_eq!(ports, vec![8000, 8080]);
    }

    #[test]
    fn garbled_table_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = dir.path().join("tcp");
        fs::write(&tcp, "header\n  0: zz:1F40 00000000:0000 0A\n").unwrap();
        let result = listening_in(&[&tcp], &[8000]);
        assert!(matches!(result, Err(DiagnosticError::Malformed { .. })));
    }

    #[test]
    fn missing_tables_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = listening_in(&[&dir.path().join("tcp")], &[8000]);
        assert!(matches!(result, Err(DiagnosticError::Unavailable(_))));
    }

    #[test]
    fn one_missing_table_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = write_table(dir.path(), "tcp", &[(word([0, 0, 0, 0]), 8000, "0A")]);
        let found = listening_in(&[&tcp, &dir.path().join("tcp6")], &[8000]).unwrap();
        assert_eq!(found.len(), 1);
    }
}
