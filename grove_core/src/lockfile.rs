//! Git-style `<file>.lock` protocol.
//!
//! The lock is created with `O_CREAT|O_EXCL`; the new content is written into
//! it and the lock is renamed over the target. Dropping an uncommitted lock
//! removes it.

use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) struct LockFile {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl LockFile {
    /// Take the lock on `target`, or `None` if another writer holds it.
    pub(crate) fn acquire(target: &Path) -> Result<Option<Self>> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = target.as_os_str().to_os_string();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => Ok(Some(Self {
                target: target.to_path_buf(),
                lock_path,
                file: Some(file),
                committed: false,
            })),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write `content`, flush it to disk and rename the lock over the target.
    pub(crate) fn commit(mut self, content: &[u8]) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&self.lock_path, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // After a commit the lock path may already belong to the next writer.
        if !self.committed {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
