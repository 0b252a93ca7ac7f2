//! Single-instance guard.
//!
//! An advisory exclusive lock on a well-known file. Cron has no idea how
//! long a cycle takes; if the previous run is still going, this one must
//! bow out cleanly rather than fight it over the same nodes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another run holds the lock.
    #[error("{} is locked by another run", .path.display())]
    Held { path: PathBuf },

    #[error("cannot open lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Holds the lock for the lifetime of the process; unlocks on drop.
#[derive(Debug)]
pub struct LockHolder {
    file: File,
}

impl LockHolder {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockHolder { file }),
            Err(err)
                if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Err(LockError::Held {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Drop for LockHolder {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
