//! Client role of the multi-client variant.
//!
//! A client binds its own datagram endpoint next to the server socket
//! (`<socket>.client.<pid>`), sends its batch of set commands (or an empty datagram
//! just to register) and then receives frames and status replies. Datagrams from
//! anyone but the server are dropped.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::distributor::{MAX_DATAGRAM, SOI};
use crate::output::{FrameBudget, FrameWriter, Framing, OutputTarget};

const RECV_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Frame(Vec<u8>),
    Status(String),
}

pub struct Client {
    socket: UnixDatagram,
    local: PathBuf,
    server: PathBuf,
    buf: Vec<u8>,
}

impl Client {
    /// Binds `<server>.client.<pid>`.
    pub fn connect(server: &Path) -> Result<Self> {
        let mut name = server.as_os_str().to_os_string();
        name.push(format!(".client.{}", std::process::id()));
        Self::connect_as(server, PathBuf::from(name))
    }

    /// Binds an explicit local endpoint.
    pub fn connect_as(server: &Path, local: PathBuf) -> Result<Self> {
        if local.exists() {
            std::fs::remove_file(&local)
                .with_context(|| format!("failed to remove stale {}", local.display()))?;
        }
        let socket = UnixDatagram::bind(&local)
            .with_context(|| format!("failed to bind client socket {}", local.display()))?;
        Ok(Self {
            socket,
            local,
            server: server.to_path_buf(),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    /// Sends a batch of control lines. An empty batch only registers the client.
    pub fn send(&self, text: &str) -> Result<()> {
        self.socket
            .send_to(text.as_bytes(), &self.server)
            .with_context(|| format!("failed to reach server at {}", self.server.display()))?;
        Ok(())
    }

    /// Waits up to `timeout` for the next datagram from the server.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket
                .set_read_timeout(Some(deadline - now))
                .context("failed to set client read timeout")?;
            let (len, from) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to receive from server"),
            };
            if from.as_pathname() != Some(self.server.as_path()) {
                log::warn!("Client: dropping datagram from unexpected sender {:?}", from);
                continue;
            }
            let data = &self.buf[..len];
            if data.starts_with(&SOI) {
                return Ok(Some(Message::Frame(data.to_vec())));
            }
            return Ok(Some(Message::Status(
                String::from_utf8_lossy(data).into_owned(),
            )));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local);
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub socket: PathBuf,
    pub commands: Vec<String>,
    pub output: Option<OutputTarget>,
    pub framing: Framing,
    pub count: Option<u64>,
    /// How long to wait for acknowledgements when not streaming.
    pub ack_timeout: Duration,
}

/// Runs a client session until the frame budget is spent or `stop` is raised.
pub fn run(options: &ClientOptions, stop: &AtomicBool) -> Result<()> {
    if options.output.is_none() && options.commands.is_empty() {
        return Err(anyhow!(
            "a server is already running; pass --set or --output to talk to it"
        ));
    }
    let mut client = Client::connect(&options.socket)?;
    let batch = options.commands.join("\n");
    client.send(&batch)?;

    let Some(target) = &options.output else {
        let mut pending = options.commands.len();
        let deadline = Instant::now() + options.ack_timeout;
        while pending > 0 && !stop.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("Client: {} command(s) not acknowledged", pending);
                break;
            }
            match client.recv(remaining.min(RECV_SLICE))? {
                Some(Message::Status(text)) => {
                    report_status(&text);
                    pending -= 1;
                }
                Some(Message::Frame(_)) | None => {}
            }
        }
        return Ok(());
    };

    let mut writer = FrameWriter::open(target, options.framing)?;
    let budget = FrameBudget::new(options.count);
    log::info!(
        "Client: streaming from {} to {} ({} framing)",
        options.socket.display(),
        target,
        options.framing
    );
    while !budget.exhausted() && !stop.load(Ordering::SeqCst) {
        match client.recv(RECV_SLICE)? {
            Some(Message::Frame(frame)) => {
                if budget.consume() {
                    writer.write_frame(&frame)?;
                }
            }
            Some(Message::Status(text)) => report_status(&text),
            None => {}
        }
    }
    log::info!("Client: wrote {} frames", writer.frames_written());
    Ok(())
}

fn report_status(text: &str) {
    if text.starts_with("error") {
        log::warn!("server: {}", text);
    } else {
        log::info!("server: {}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn datagrams_from_strangers_are_dropped() -> Result<()> {
        let dir = tempdir()?;
        let server_path = dir.path().join("server");
        let server = UnixDatagram::bind(&server_path)?;
        let mut client = Client::connect_as(&server_path, dir.path().join("me"))?;
        client.send("")?;
        let (_, from) = server.recv_from(&mut [0u8; 16])?;
        assert_eq!(from.as_pathname(), Some(client.local_path()));

        let stranger = UnixDatagram::bind(dir.path().join("stranger"))?;
        stranger.send_to(&[0xFF, 0xD8, 9], client.local_path())?;
        server.send_to(b"ok quality", client.local_path())?;
        server.send_to(&[0xFF, 0xD8, 1], client.local_path())?;

        assert_eq!(
            client.recv(Duration::from_secs(1))?,
            Some(Message::Status("ok quality".to_string()))
        );
        assert_eq!(
            client.recv(Duration::from_secs(1))?,
            Some(Message::Frame(vec![0xFF, 0xD8, 1]))
        );
        assert_eq!(client.recv(Duration::from_millis(20))?, None);
        Ok(())
    }

    #[test]
    fn client_endpoint_is_removed_on_drop() -> Result<()> {
        let dir = tempdir()?;
        let local = dir.path().join("me");
        let client = Client::connect_as(&dir.path().join("server"), local.clone())?;
        assert!(local.exists());
        drop(client);
        assert!(!local.exists());
        Ok(())
    }
}
