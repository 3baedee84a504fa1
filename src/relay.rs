//! Handoff of filled buffers from hardware threads to the control loop.
//!
//! Deferred delivery: the hardware callback tags the buffer `InTransit`, pushes
//! `(PortId, Buffer)` into a bounded channel and writes one wake byte to a socket
//! pair. The control loop polls the read end, drains the channel and does all
//! assembly and recycling itself. The channel is sized to the pool capacity, so a
//! push can never find it full.
//!
//! Immediate delivery skips the channel: `consume_buffer` runs on the hardware
//! thread.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

use crate::assembler::{Assembly, FrameAssembler};
use crate::hal::{BufferCallback, PortHandle, PortId};
use crate::pool::{Buffer, BufferPool, Owner};

pub struct RelayMessage {
    pub port: PortId,
    pub buffer: Buffer,
}

/// Hardware-thread side of the relay.
pub struct RelaySender {
    tx: SyncSender<RelayMessage>,
    wake: UnixStream,
}

/// Control-loop side of the relay.
pub struct RelayReceiver {
    rx: Receiver<RelayMessage>,
    wake: UnixStream,
    scratch: [u8; 64],
}

pub fn channel(capacity: usize) -> Result<(RelaySender, RelayReceiver)> {
    let (wake_tx, wake_rx) = UnixStream::pair().context("failed to create relay wake socket")?;
    wake_rx
        .set_nonblocking(true)
        .context("failed to make relay wake socket non-blocking")?;
    let (tx, rx) = mpsc::sync_channel(capacity);
    Ok((
        RelaySender { tx, wake: wake_tx },
        RelayReceiver {
            rx,
            wake: wake_rx,
            scratch: [0u8; 64],
        },
    ))
}

impl RelaySender {
    pub fn deliver(&mut self, port: PortId, mut buffer: Buffer) -> Result<()> {
        buffer.set_owner(Owner::InTransit);
        match self.tx.try_send(RelayMessage { port, buffer }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(anyhow!("relay channel full; more buffers in flight than the pool holds"))
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(anyhow!("relay channel disconnected"))
            }
        }
        self.wake
            .write_all(&[1])
            .context("failed to write relay wake byte")
    }

    /// Wraps the sender as a port callback. A relay failure on the hardware thread
    /// terminates the process.
    pub fn into_callback(mut self) -> BufferCallback {
        Box::new(move |port: &PortHandle, buffer: Buffer| {
            if let Err(e) = self.deliver(port.id(), buffer) {
                log::error!("fatal relay failure on {}: {:#}", port.id(), e);
                std::process::exit(1);
            }
        })
    }
}

impl RelayReceiver {
    /// Consumes pending wake bytes and returns every queued message in arrival order.
    pub fn drain(&mut self) -> Result<Vec<RelayMessage>> {
        loop {
            match self.wake.read(&mut self.scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read relay wake socket"),
            }
        }
        let mut messages = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(message) => messages.push(message),
                // The sender goes away with the port callback; nothing more can arrive.
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(messages)
    }
}

impl AsRawFd for RelayReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

// ---- Recycling ----

/// Returns a consumed buffer to its pool and, while the port is enabled, submits a
/// replacement.
pub fn recycle(pool: &BufferPool, port: &PortHandle, buffer: Buffer) -> Result<()> {
    pool.release(buffer)?;
    if !port.is_enabled() {
        return Ok(());
    }
    let next = pool
        .take()
        .ok_or_else(|| anyhow!("no pool buffer available to resubmit to {}", port.id()))?;
    if let Err(refused) = port.send_buffer(next) {
        // Port was disabled between the check and the submit; the flush owns it now.
        pool.release(refused)?;
    }
    Ok(())
}

/// Full handling of one buffer handed back by the hardware: claim it, feed
/// non-empty payloads to the assembler, pass complete frames to `emit`, recycle.
pub fn consume_buffer<F>(
    pool: &BufferPool,
    assembler: &mut FrameAssembler,
    port: &PortHandle,
    mut buffer: Buffer,
    mut emit: F,
) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    pool.claim(&mut buffer)?;
    let mut emitted = Ok(());
    if !buffer.is_empty() {
        if let Assembly::Complete(frame) = assembler.push(buffer.payload(), buffer.is_frame_end()) {
            emitted = emit(frame);
        }
    }
    // The buffer goes back even when the consumer failed.
    recycle(pool, port, buffer)?;
    emitted
}
