//! Daemonisation and pid file handling.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Pid file opened before forking, written after, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    /// Create (or truncate) the pid file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("Failed to open pid file {}", path.display()))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Write the current process id and close the file.
    pub fn write_pid(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            write!(file, "{}", std::process::id())
                .with_context(|| format!("Failed to write pid file {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Detach from the controlling terminal.
///
/// Must run before any thread is started: only the calling thread
/// survives the fork.
pub fn daemonize() -> Result<()> {
    nix::unistd::daemon(false, false)
        .map_err(std::io::Error::from)
        .context("Failed to daemonize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xendevd.pid");

        let mut pid_file = PidFile::create(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        pid_file.write_pid().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_unwritable_location() {
        let err = PidFile::create("/nonexistent-dir/xendevd.pid").unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.raw_os_error(), Some(libc::ENOENT));
    }
}
