use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use uuid::Uuid;

use crate::error::{IoContext, StoreResult};

/// Replace `path` with `bytes` via a temp file in the same directory and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .io_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .io_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .io_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .io_context(|| format!("flushing temp file {}", temp_path.display()))?;
        file.sync_all()
            .io_context(|| format!("syncing temp file {}", temp_path.display()))?;
        fs::rename(&temp_path, path).io_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written?;
    sync_dir(parent)
}

/// Make directory entries (new files, renames) durable.
pub(crate) fn sync_dir(dir: &Path) -> StoreResult<()> {
    #[cfg(unix)]
    {
        let handle =
            File::open(dir).io_context(|| format!("opening directory {}", dir.display()))?;
        handle
            .sync_all()
            .io_context(|| format!("syncing directory {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Size of a file in bytes, `0` when it does not exist.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}
