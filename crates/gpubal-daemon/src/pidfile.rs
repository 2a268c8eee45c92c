//! PID marker files and process signalling

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// PID marker owned by the running daemon; removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid to `path`.
    ///
    /// Fails if the file names a live process. A marker left by a dead
    /// process is replaced.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path)? {
            if is_running(pid) {
                bail!("daemon already running with pid {} ({})", pid, path.display());
            }
            warn!(pid, path = %path.display(), "Replacing stale pid file");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
        debug!(path = %path.display(), "Wrote pid file");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
            }
        }
    }
}

/// Read a pid marker; `None` if the file does not exist
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let pid = raw
                .trim()
                .parse()
                .with_context(|| format!("malformed pid file {}", path.display()))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading pid file {}", path.display())),
    }
}

/// Send `signal` (e.g. "TERM", "KILL") to `pid`
pub fn send_signal(pid: u32, signal: &str) -> Result<()> {
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .status()
        .context("running kill")?;
    if !status.success() {
        bail!("failed to send SIG{} to pid {}", signal, pid);
    }
    Ok(())
}

/// Whether a process with this pid exists
pub fn is_running(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("gpubald.pid");

        let marker = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
        assert_eq!(marker.path(), path.as_path());

        // Our own pid is alive, so a second daemon is refused
        assert!(PidFile::create(&path).is_err());

        drop(marker);
        assert!(!path.exists());
        assert_eq!(read_pid(&path).unwrap(), None);
    }

    #[test]
    fn test_stale_marker_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gpubald.pid");
        // Above the default pid_max, so never a live process
        fs::write(&path, "4194305\n").unwrap();

        let _marker = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_malformed_marker() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gpubald.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_is_running_self() {
        assert!(is_running(std::process::id()));
        assert!(!is_running(4194305));
    }
}
