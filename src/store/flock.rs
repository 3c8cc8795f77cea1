//! Advisory exclusive lock on the backing file.

use std::fs::File;

use fs2::FileExt as _;

use crate::error::Result;

/// Holds an advisory exclusive lock on the storage's backing file for the
/// lifetime of the value. A second open of the same path, from this process
/// or another, fails while the lock is held.
pub struct Flock {
    lock_fd: File,
}

impl Flock {
    pub fn lock(file: &File) -> Result<Flock> {
        let lock_fd = file.try_clone()?;
        lock_fd.try_lock_exclusive()?;
        Ok(Flock { lock_fd })
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_fd.unlock() {
            log::warn!("failed to release storage file lock: {e}");
        }
    }
}
