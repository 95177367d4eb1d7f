//! Exclusive ownership of a store directory

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{FlockArg, flock};
use tracing::debug;

use crate::error::StoreError;

const LOCK_FILE: &str = ".lock";

/// Advisory lock on `<dir>/.lock`, released when dropped or the process exits
#[derive(Debug)]
pub(crate) struct DirLock {
    path: PathBuf,
    _file: File,
}

impl DirLock {
    /// Take the lock without waiting
    ///
    /// # Errors
    /// Returns [`StoreError::Locked`] if another holder has it
    pub(crate) fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EAGAIN) => return Err(StoreError::Locked(dir.display().to_string())),
            Err(e) => return Err(StoreError::Io(format!("locking {}: {e}", path.display()))),
        }

        // Holder pid, for operators only
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(path = %path.display(), "store directory locked");
        Ok(Self { path, _file: file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "store directory released");
    }
}
