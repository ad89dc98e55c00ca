//! Service log access: name resolution, tail, and follow.
//!
//! Logs are only ever read here. Following is a polling loop that reopens
//! the file when it is truncated or replaced, and stops when the caller's
//! predicate says so.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};

pub const DEFAULT_TAIL_LINES: usize = 20;

const TAIL_CHUNK: u64 = 8 * 1024;

/// Log path for a `logs` argument. `None` and the aggregate aliases map to
/// the aggregate service's legacy file; an unregistered name maps to
/// `<name>.log`.
pub fn resolve_log(settings: &Settings, name: Option<&str>) -> PathBuf {
    match settings.registry.lookup_log_target(name) {
        Some(service) => settings.log_path(service),
        None => settings
            .log_dir
            .join(format!("{}.log", name.unwrap_or(settings.registry.aggregate_id()))),
    }
}

/// `*.log` files in `log_dir`, sorted. A missing directory has none.
pub fn list_logs(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut logs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// The last `n` lines of `path`, read backwards in chunks so large logs are
/// not loaded whole.
pub fn last_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    lines_before(&mut file, len, n)
}

/// The last `n` lines of `file` ending at byte `end`. Anything past `end`
/// is left for the caller.
fn lines_before(file: &mut File, end: u64, n: usize) -> io::Result<Vec<String>> {
    if n == 0 || end == 0 {
        return Ok(Vec::new());
    }

    let mut start = end;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let next = start.saturating_sub(TAIL_CHUNK);
        let mut chunk = vec![0u8; usize::try_from(start - next).unwrap_or(0)];
        file.seek(SeekFrom::Start(next))?;
        file.read_exact(&mut chunk)?;
        chunk.append(&mut buf);
        buf = chunk;
        start = next;
        // One newline more than needed guarantees the first kept line is
        // complete.
        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        if start == 0 || newlines > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| (*l).to_string()).collect())
}

/// Print the last `lines` lines of the log, then stream appended content to
/// `out` until `keep_going` returns false.
///
/// A missing log is reported as [`Error::LogNotFound`] with the log files
/// that do exist.
pub fn tail_logs<W: Write>(
    settings: &Settings,
    name: Option<&str>,
    lines: usize,
    out: &mut W,
    keep_going: impl FnMut() -> bool,
) -> Result<()> {
    let path = resolve_log(settings, name);
    if !path.is_file() {
        return Err(Error::LogNotFound {
            available: list_logs(&settings.log_dir)?,
            path,
        });
    }
    follow(&path, lines, settings.timing.follow_poll, out, keep_going)
}

/// Follow `path` from its current end after printing its last `lines`
/// lines.
pub fn follow<W: Write>(
    path: &Path,
    lines: usize,
    poll: Duration,
    out: &mut W,
    mut keep_going: impl FnMut() -> bool,
) -> Result<()> {
    // One handle and one length for both the tail and the follow position,
    // so nothing appended in between is skipped.
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let mut inode = meta.ino();
    let mut pos = meta.len();
    for line in lines_before(&mut file, pos, lines)? {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    let mut buf = Vec::new();

    while keep_going() {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            // Mid-rotation: the old file is gone and the new one not yet
            // created.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                thread::sleep(poll);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if meta.ino() != inode || meta.len() < pos {
            debug!(path = %path.display(), "log truncated or replaced, reopening");
            file = File::open(path)?;
            inode = meta.ino();
            pos = 0;
        }

        if meta.len() > pos {
            file.seek(SeekFrom::Start(pos))?;
            buf.clear();
            let read = (&mut file).take(meta.len() - pos).read_to_end(&mut buf)?;
            out.write_all(&buf)?;
            out.flush()?;
            pos += read as u64;
        } else {
            thread::sleep(poll);
        }
    }
    Ok(())
}
