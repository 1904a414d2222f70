//! Exclusive pidfile.
//!
//! The file is locked with an advisory lock for the lifetime of the
//! [`Pidfile`], so a second daemon pointed at the same path refuses to
//! start.

use crate::error::{DaemonError, DaemonResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A locked pidfile, removed on drop.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    file: File,
}

impl Pidfile {
    /// Locks `path` and writes the current process id into it.
    ///
    /// # Errors
    ///
    /// Returns `PidfileLocked` if another process holds the lock.
    pub fn acquire(path: &Path) -> DaemonResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| DaemonError::PidfileLocked(path.to_path_buf()))?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        debug!(path = %path.display(), "pidfile locked");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path of the pidfile.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove pidfile");
        }
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtsyncd.pid");
        let pidfile = Pidfile::acquire(&path).unwrap();

        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtsyncd.pid");
        let _held = Pidfile::acquire(&path).unwrap();

        let err = Pidfile::acquire(&path).unwrap_err();
        assert!(matches!(err, DaemonError::PidfileLocked(p) if p == path));
    }

    #[test]
    fn removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtsyncd.pid");
        drop(Pidfile::acquire(&path).unwrap());

        assert!(!path.exists());
        let _again = Pidfile::acquire(&path).unwrap();
    }
}
