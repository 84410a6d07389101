//! Exclusive write lock for single-file mode.
//!
//! All collectors of a step append to the same file. Each one takes a
//! blocking `flock(LOCK_EX)` on a side lock file for the duration of its
//! write. The lock is advisory and per open file description, so two handles
//! in the same process exclude each other just like two processes do.

use jr_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

impl WriteLock {
    /// Block until the lock at `path` is ours.
    ///
    /// There is no timeout: a holder that never releases blocks every other
    /// writer of the step. The holder's PID is left in the lock file to make
    /// such a situation diagnosable.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_err = |source: std::io::Error| Error::Lock {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // contents are only a token
            .open(path)
            .map_err(lock_err)?;

        trace!(path = %path.display(), "waiting for write lock");
        flock_exclusive(&file).map_err(lock_err)?;

        let lock = Self {
            file,
            path: path.to_path_buf(),
        };
        // From here on errors still release the lock through Drop.
        lock.file.set_len(0).map_err(lock_err)?;
        let mut writer = &lock.file;
        write!(writer, "{}", std::process::id()).map_err(lock_err)?;
        writer.flush().map_err(lock_err)?;

        debug!(path = %lock.path.display(), pid = std::process::id(), "write lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "advisory file locking requires a unix platform",
    ))
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // The lock file stays: unlinking it would let a waiter lock a
        // deleted inode while a newcomer locks a fresh file.
        trace!(path = %self.path.display(), "write lock released");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_pid_token_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let lock = WriteLock::acquire(&path).unwrap();
        let token = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(token, std::process::id().to_string());
        drop(lock);
        assert!(path.exists());
    }

    #[test]
    fn test_mutual_exclusion_between_handles() {
        let dir = tempdir().unwrap();
        let path = Arc::new(dir.path().join("shared.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        let _lock = WriteLock::acquire(&path).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_directory_is_lock_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope").join("x.lock");
        assert!(matches!(WriteLock::acquire(&path), Err(Error::Lock { .. })));
    }
}
