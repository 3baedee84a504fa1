//! Named-pipe control transport.
//!
//! The pipe is opened non-blocking for reading, plus a write handle we never use so
//! the read side does not see end-of-file every time an operator's writer closes.
//! Complete lines are handed out as they arrive; a trailing partial line waits in
//! the reader until its newline is written.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub struct FifoControl {
    path: PathBuf,
    reader: File,
    _keepalive: File,
    partial: Vec<u8>,
}

impl FifoControl {
    pub fn open(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("control pipe {} not found", path.display()))?;
        if !meta.file_type().is_fifo() {
            return Err(anyhow!("{} is not a named pipe", path.display()));
        }
        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("failed to open control pipe {}", path.display()))?;
        let keepalive = OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open control pipe {} for writing", path.display()))?;
        log::info!("FifoControl: reading commands from {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            _keepalive: keepalive,
            partial: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the complete lines currently available, newline included.
    pub fn read_available(&mut self) -> Result<String> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.partial.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to read {}", self.path.display()))
                }
            }
        }
        let complete = match self.partial.iter().rposition(|b| *b == b'\n') {
            Some(last) => last + 1,
            None => return Ok(String::new()),
        };
        let lines: Vec<u8> = self.partial.drain(..complete).collect();
        Ok(String::from_utf8_lossy(&lines).into_owned())
    }
}

impl AsRawFd for FifoControl {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}
