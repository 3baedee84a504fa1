//! Subscriber registry over a local datagram socket.
//!
//! The server binds one datagram socket. Any bound peer that sends a datagram is
//! registered (up to `MAX_CLIENTS`); the datagram body is a batch of control lines.
//! Every assembled frame is sent to each registered peer with a non-blocking send and
//! a peer whose send fails is evicted. Frames and status replies share the socket:
//! frames start with the JPEG SOI marker, replies are plain text.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use crate::output::FrameSink;

pub const MAX_CLIENTS: usize = 8;
pub const MAX_DATAGRAM: usize = 65536;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Debug)]
pub struct Datagram {
    /// Bound path of the sender; `None` for anonymous sockets.
    pub sender: Option<PathBuf>,
    pub text: String,
}

pub struct Distributor {
    socket: UnixDatagram,
    path: PathBuf,
    clients: Vec<PathBuf>,
    recv_buf: Vec<u8>,
}

impl Distributor {
    /// Binds the server socket, replacing a stale socket file left at `path`.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }
        let socket = UnixDatagram::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        socket
            .set_nonblocking(true)
            .context("failed to make server socket non-blocking")?;
        log::info!("Distributor: listening on {}", path.display());
        Ok(Self {
            socket,
            path: path.to_path_buf(),
            clients: Vec::with_capacity(MAX_CLIENTS),
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clients(&self) -> &[PathBuf] {
        &self.clients
    }

    /// Adds `addr` unless it is already known or the registry is full.
    pub fn register(&mut self, addr: &Path) -> bool {
        if self.clients.iter().any(|c| c == addr) {
            return true;
        }
        if self.clients.len() >= MAX_CLIENTS {
            log::warn!(
                "Distributor: refusing {}; already serving {} clients",
                addr.display(),
                MAX_CLIENTS
            );
            return false;
        }
        log::info!("Distributor: client {} registered", addr.display());
        self.clients.push(addr.to_path_buf());
        true
    }

    /// Reads one pending datagram, registering its sender. `None` when nothing is
    /// waiting.
    pub fn receive(&mut self) -> Result<Option<Datagram>> {
        let (len, addr) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e).context("failed to receive on server socket"),
        };
        let sender = addr.as_pathname().map(Path::to_path_buf);
        match &sender {
            Some(path) => {
                self.register(path);
            }
            None => log::debug!("Distributor: datagram from unbound sender"),
        }
        let text = String::from_utf8_lossy(&self.recv_buf[..len]).into_owned();
        Ok(Some(Datagram { sender, text }))
    }

    /// Sends `frame` to every client. Returns how many received it.
    /// Frames longer than `MAX_DATAGRAM` are skipped: subscribers would only see a
    /// truncated image.
    pub fn broadcast(&mut self, frame: &[u8]) -> usize {
        if frame.len() > MAX_DATAGRAM {
            log::warn!(
                "Distributor: skipping {} byte frame, larger than one datagram",
                frame.len()
            );
            return 0;
        }
        let socket = &self.socket;
        self.clients.retain(|client| match socket.send_to(frame, client) {
            Ok(_) => true,
            Err(e) => {
                log::info!("Distributor: dropping client {}: {}", client.display(), e);
                false
            }
        });
        self.clients.len()
    }

    /// Sends a status line to one peer. A failed reply evicts the peer.
    pub fn reply(&mut self, to: &Path, text: &str) {
        if let Err(e) = self.socket.send_to(text.as_bytes(), to) {
            log::info!("Distributor: reply to {} failed: {}", to.display(), e);
            self.clients.retain(|client| client != to);
        }
    }
}

impl FrameSink for Distributor {
    fn emit(&mut self, frame: &[u8]) -> Result<()> {
        self.broadcast(frame);
        Ok(())
    }
}

impl AsRawFd for Distributor {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
