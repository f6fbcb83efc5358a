//! Exclusive advisory lock guarding the state store for the length of a run.
//!
//! The OS drops `flock`-style locks when the holding process exits, so a
//! crashed run never leaves a stale lock behind.
use crate::error::SyncError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// RAII guard; the lock is released when this value is dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock, polling for at most `wait`. A zero `wait` makes a
    /// single attempt.
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(SyncError::persistence)?;
            }
        }

        let start = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(SyncError::persistence)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut lock = Self {
                        file,
                        path: path.to_path_buf(),
                    };
                    if let Err(err) = lock.write_owner() {
                        warn!(?err, path = %path.display(), "could not record lock owner");
                    }
                    debug!(path = %path.display(), "state lock acquired");
                    return Ok(lock);
                }
                Err(err) if is_contended(&err) => {
                    if start.elapsed() >= wait {
                        return Err(SyncError::StateConflict(path.to_path_buf()));
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(SyncError::persistence(err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_owner(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        writeln!(self.file, "{}", std::process::id())?;
        self.file.sync_data()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.db.lock");
        let first = RunLock::acquire(&path, Duration::ZERO).unwrap();

        let err = RunLock::acquire(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, SyncError::StateConflict(p) if p == path));

        drop(first);
        let again = RunLock::acquire(&path, Duration::ZERO).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn lock_file_records_owner_pid() {
        let td = tempdir().unwrap();
        let path = td.path().join("locks").join("run.lock");
        let _lock = RunLock::acquire(&path, Duration::ZERO).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
