//! Filesystem-backed pid store: `<pid_dir>/<service_id>.pid`.
//!
//! The pid file is the only record of a running service between
//! invocations. Concurrent invocations are not synchronised; the last
//! writer wins.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

impl PidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, service_id: &str) -> PathBuf {
        self.dir.join(format!("{service_id}.pid"))
    }

    /// Read the recorded pid. `Ok(None)` when no record exists.
    ///
    /// Pids 0 and 1 are refused: signalling them would hit a process group
    /// or init rather than a service.
    pub fn read(&self, service_id: &str) -> Result<Option<u32>> {
        let path = self.path(service_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 1 && i32::try_from(pid).is_ok() => Ok(Some(pid)),
            _ => Err(Error::InvalidPidFile { path, contents }),
        }
    }

    /// Persist `pid`, creating the directory if needed and overwriting any
    /// previous record.
    pub fn write(&self, service_id: &str, pid: u32) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(service_id), format!("{pid}\n"))?;
        Ok(())
    }

    /// Delete the record. A missing file is not an error.
    pub fn remove(&self, service_id: &str) -> Result<()> {
        match fs::remove_file(self.path(service_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, service_id: &str) -> bool {
        self.path(service_id).exists()
    }
}
