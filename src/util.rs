//! Process utilities

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A single-instance lock backed by a create-exclusive file in the temp
/// directory. The file is removed on drop; a stale file left by a crash
/// must be removed by the operator.
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Try to acquire the named lock.
    pub fn acquire(name: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{}.lock", name));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => Ok(Self {
                path,
                file: Some(file),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::Config(format!(
                "another instance of {} is already running (lock file: {})",
                name,
                path.display()
            ))),
            Err(e) => Err(Error::Config(format!("create lock file: {}", e))),
        }
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_instance() {
        let name = format!("aether-test-{}", std::process::id());
        let lock = FileLock::acquire(&name).unwrap();
        assert!(FileLock::acquire(&name).is_err());
        lock.release();
        let relock = FileLock::acquire(&name).unwrap();
        drop(relock);
    }
}
