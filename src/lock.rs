//! Single-instance lock.
//!
//! The lock file holds the server pid as text. A live pid means another server owns
//! the camera and this process becomes a client. A missing, unparsable or dead pid is
//! stale and gets reclaimed. The file is removed when the lock is dropped.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::sys;

#[derive(Debug)]
pub struct ServerLock {
    path: PathBuf,
    pid: u32,
}

/// Outcome of trying to take the lock.
#[derive(Debug)]
pub enum LockState {
    Acquired(ServerLock),
    HeldBy(u32),
}

impl ServerLock {
    pub fn acquire(path: &Path) -> Result<LockState> {
        if let Some(pid) = read_pid(path)? {
            if sys::pid_alive(pid as i32) && pid != std::process::id() {
                return Ok(LockState::HeldBy(pid));
            }
            log::info!(
                "ServerLock: reclaiming stale lock {} (pid {})",
                path.display(),
                pid
            );
        }
        let pid = std::process::id();
        std::fs::write(path, format!("{}\n", pid))
            .with_context(|| format!("failed to write lock file {}", path.display()))?;
        Ok(LockState::Acquired(Self {
            path: path.to_path_buf(),
            pid,
        }))
    }

    /// Pid of a live server holding `path`, if any.
    pub fn holder(path: &Path) -> Result<Option<u32>> {
        Ok(read_pid(path)?.filter(|pid| sys::pid_alive(*pid as i32)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ServerLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!(
                "ServerLock: failed to remove {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read lock file {}", path.display())),
    }
}
