// ABOUTME: Advisory pid-file lock that keeps scheduled runs from overlapping
// ABOUTME: Stale lock files left by dead processes are replaced

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Check if a process with the given PID is running.
#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // Send signal 0 to check if process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    // Without a liveness probe every existing lock is treated as held
    true
}

/// Read the PID stored in a lock file, if any.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read lock file: {:?}", path))?;

    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in lock file: {}", content.trim()))?;

    Ok(Some(pid))
}

/// Held run lock; the file is removed when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`, failing if another live process holds it.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {:?}", parent))?;
        }

        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("Failed to write lock file: {:?}", path))?;
                    tracing::debug!("Acquired run lock {:?}", path);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_pid(&path) {
                        Ok(Some(pid)) if is_process_running(pid) => {
                            bail!(
                                "Another sync run is in progress (PID {}). Lock file: {:?}",
                                pid,
                                path
                            );
                        }
                        Ok(_) | Err(_) => {
                            tracing::warn!("Removing stale lock file {:?}", path);
                            fs::remove_file(&path).with_context(|| {
                                format!("Failed to remove stale lock file: {:?}", path)
                            })?;
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock file: {:?}", path))
                }
            }
        }

        bail!("Could not acquire run lock {:?}", path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.pid");

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id() as i32));
        assert_eq!(lock.path(), path.as_path());

        drop(lock);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_live_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.pid");

        let _held = RunLock::acquire(&path).unwrap();
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("in progress"));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_held_by_init_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.pid");
        // PID 1 is always alive, and owned by another user unless running as root
        fs::write(&path, "1").unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("in progress"));
        assert_eq!(read_pid(&path).unwrap(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.pid");
        // PIDs this large are above the kernel's pid_max
        fs::write(&path, "2147483000").unwrap();

        let _lock = RunLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.pid");
        fs::write(&path, "not a pid").unwrap();

        assert!(RunLock::acquire(&path).is_ok());
    }
}
