//! Advisory `flock()` lock guarding merges into the shared store file.
//!
//! Each acquisition opens its own file description, so the lock excludes
//! other threads of the same process as well as other processes. The holder
//! writes its pid into the lock file so a timed-out waiter can name it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A held store lock. Dropping it releases the lock.
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Attempt to acquire the lock without waiting.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Self> {
        let file = Self::open(lock_path)?;
        Self::try_lock_exclusive(&file)?;
        Self::held(file)
    }

    /// Poll for the lock until `timeout` elapses. Returns `TimedOut` when
    /// another holder keeps it that long.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = Self::open(lock_path)?;
        let deadline = Instant::now() + timeout;

        loop {
            match Self::try_lock_exclusive(&file) {
                Ok(()) => return Self::held(file),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "Timed out after {:?} waiting for {} (held by pid {})",
                                timeout,
                                lock_path.display(),
                                Self::holder(lock_path)
                                    .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
                            ),
                        ));
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pid written by the current or most recent holder.
    pub fn holder(lock_path: &Path) -> Option<u32> {
        let mut contents = String::new();
        File::open(lock_path).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    fn held(mut file: File) -> io::Result<Self> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        Ok(StoreLock { file })
    }

    fn open(lock_path: &Path) -> io::Result<File> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Embedding store is locked by another writer",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // No advisory locking off Unix; buffers still keep data safe
        Ok(())
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // Closing the descriptor unlocks too, so a failed LOCK_UN is harmless
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
