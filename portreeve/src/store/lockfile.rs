//! Advisory file locking with bounded retries.
//!
//! Both the state file and the user config file are guarded by sidecar
//! `.lock` files taken through `fs2`. Acquisition retries briefly on
//! contention; a lock file whose holder has been gone longer than the
//! stale horizon is broken rather than waited on forever.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;

use crate::error::{Error, Result};

/// How long a lock file may sit unmodified before it is considered
/// abandoned by a crashed holder.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Default total time to keep retrying acquisition.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// An acquired advisory lock; released (and its sidecar removed) on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquires the lock guarding `target`, retrying up to
    /// [`ACQUIRE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] when the lock stays contended past
    /// the deadline, or an I/O error when the sidecar cannot be created.
    pub fn acquire(target: &Path) -> Result<Self> {
        Self::acquire_with_timeout(target, ACQUIRE_TIMEOUT)
    }

    /// Acquires with an explicit retry budget.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::acquire`].
    pub fn acquire_with_timeout(target: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = lock_path_for(target);
        let deadline = Instant::now() + timeout;

        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // Mark the hold time so other processes can age us.
                    let _ = file.set_len(0);
                    return Ok(Self { file, lock_path });
                }
                Err(_) => {
                    break_if_stale(&lock_path);
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            path: lock_path,
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }

    /// The sidecar path this lock holds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Sidecar lock path for a target file: `config.json` → `config.json.lock`.
fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map_or_else(|| "portreeve".into(), std::ffi::OsStr::to_os_string);
    name.push(".lock");
    target.with_file_name(name)
}

/// Removes a lock sidecar whose mtime is older than [`STALE_AFTER`].
///
/// The exclusive flock is still the authority; this only clears wreckage
/// from holders that died without dropping. Failure to stat or remove is
/// ignored and the normal retry loop continues.
fn break_if_stale(lock_path: &Path) {
    let Ok(metadata) = std::fs::metadata(lock_path) else {
        return;
    };
    let Ok(modified) = metadata.modified() else {
        return;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age > STALE_AFTER {
        let _ = std::fs::remove_file(lock_path);
    }
}
