use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{IoContext, StoreError, StoreResult};

/// Exclusive advisory lock held by the single writer of a source. Released on drop.
#[derive(Debug)]
pub struct SourceLock {
    _lock_file: File,
    path: PathBuf,
}

impl SourceLock {
    /// Take the lock without waiting; a held lock is reported as [`StoreError::Locked`].
    pub fn try_acquire(path: &Path, source_code: &str) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .io_context(|| format!("opening lock file {}", path.display()))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                return Err(StoreError::Locked {
                    source_code: source_code.to_string(),
                    path: path.to_path_buf(),
                })
            }
            Err(err) => {
                return Err(StoreError::io(
                    format!("locking {}", path.display()),
                    err,
                ))
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .io_context(|| format!("writing lock owner to {}", path.display()))?;
        debug!(source = source_code, path = %path.display(), "acquired source lock");
        Ok(Self {
            _lock_file: lock_file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
