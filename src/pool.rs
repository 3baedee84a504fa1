//! Fixed-size buffer pool owned by the producing output port.
//!
//! Buffers are lent out and always come back to the pool queue. Every handle carries
//! an ownership tag and the pool only accepts legal transitions:
//!
//! - `take`: Pooled -> Application
//! - `PortHandle::send_buffer`: Application -> Hardware
//! - relay delivery: Hardware -> InTransit
//! - `claim`: Hardware | InTransit -> Application
//! - `release`: Application -> Pooled

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Buffer flag: this fragment ends a compressed frame.
pub const FLAG_FRAME_END: u32 = 1 << 0;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Pooled,
    Hardware,
    InTransit,
    Application,
}

/// Handle to one pool buffer. Not clonable: exactly one handle exists per buffer.
#[derive(Debug)]
pub struct Buffer {
    pool: PoolId,
    index: usize,
    data: Vec<u8>,
    len: usize,
    flags: u32,
    owner: Owner,
}

impl Buffer {
    pub fn pool_id(&self) -> PoolId {
        self.pool
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_frame_end(&self) -> bool {
        self.flags & FLAG_FRAME_END != 0
    }

    /// Copies as much of `bytes` as fits and returns the number of bytes taken.
    pub fn fill(&mut self, bytes: &[u8], flags: u32) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        self.flags = flags;
        n
    }

    /// Empties the payload. Flushed buffers come back this way.
    pub fn clear(&mut self) {
        self.len = 0;
        self.flags = 0;
    }

    pub(crate) fn set_owner(&mut self, owner: Owner) {
        self.owner = owner;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub outstanding: usize,
}

struct PoolState {
    free: VecDeque<Buffer>,
    home: Vec<bool>,
    destroyed: bool,
}

/// Clonable handle; clones share the same queue.
#[derive(Clone)]
pub struct BufferPool {
    id: PoolId,
    capacity: usize,
    buffer_size: usize,
    state: Arc<Mutex<PoolState>>,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Result<Self> {
        if count == 0 || buffer_size == 0 {
            return Err(anyhow!(
                "buffer pool needs a non-zero count and size (got {} x {})",
                count,
                buffer_size
            ));
        }
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        let free = (0..count)
            .map(|index| Buffer {
                pool: id,
                index,
                data: vec![0u8; buffer_size],
                len: 0,
                flags: 0,
                owner: Owner::Pooled,
            })
            .collect();
        Ok(Self {
            id,
            capacity: count,
            buffer_size,
            state: Arc::new(Mutex::new(PoolState {
                free,
                home: vec![true; count],
                destroyed: false,
            })),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Hands out a free buffer owned by the application, or `None` if the queue is
    /// empty or the pool is destroyed.
    pub fn take(&self) -> Option<Buffer> {
        let mut state = self.lock().ok()?;
        if state.destroyed {
            return None;
        }
        let mut buffer = state.free.pop_front()?;
        state.home[buffer.index] = false;
        buffer.clear();
        buffer.set_owner(Owner::Application);
        Some(buffer)
    }

    /// Takes application ownership of a buffer handed back by the hardware.
    pub fn claim(&self, buffer: &mut Buffer) -> Result<()> {
        self.check_origin(buffer)?;
        match buffer.owner {
            Owner::Hardware | Owner::InTransit => {
                buffer.set_owner(Owner::Application);
                Ok(())
            }
            other => Err(anyhow!(
                "cannot claim buffer {} of {}: owned by {:?}",
                buffer.index,
                self.id,
                other
            )),
        }
    }

    /// Returns an application-owned buffer to the queue.
    pub fn release(&self, mut buffer: Buffer) -> Result<()> {
        self.check_origin(&buffer)?;
        if buffer.owner != Owner::Application {
            return Err(anyhow!(
                "cannot release buffer {} of {}: owned by {:?}",
                buffer.index,
                self.id,
                buffer.owner
            ));
        }
        let mut state = self.lock()?;
        if state.home[buffer.index] {
            return Err(anyhow!(
                "double release of buffer {} of {}",
                buffer.index,
                self.id
            ));
        }
        state.home[buffer.index] = true;
        buffer.clear();
        buffer.set_owner(Owner::Pooled);
        state.free.push_back(buffer);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.lock().map(|state| state.free.len()).unwrap_or(0);
        PoolStats {
            capacity: self.capacity,
            available,
            outstanding: self.capacity - available,
        }
    }

    /// Destroys the pool. Refused while any buffer is away from the queue.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.destroyed {
            return Err(anyhow!("{} already destroyed", self.id));
        }
        let outstanding = self.capacity - state.free.len();
        if outstanding > 0 {
            return Err(anyhow!(
                "refusing to destroy {}: {} of {} buffers outstanding",
                self.id,
                outstanding,
                self.capacity
            ));
        }
        state.destroyed = true;
        state.free.clear();
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().map(|state| state.destroyed).unwrap_or(true)
    }

    fn check_origin(&self, buffer: &Buffer) -> Result<()> {
        if buffer.pool != self.id {
            return Err(anyhow!(
                "buffer {} belongs to {}, not {}",
                buffer.index,
                buffer.pool,
                self.id
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("{} state poisoned", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_release_track_occupancy() -> Result<()> {
        let pool = BufferPool::new(3, 64)?;
        let a = pool.take().expect("buffer");
        let b = pool.take().expect("buffer");
        assert_eq!(a.owner(), Owner::Application);
        assert_eq!(pool.stats().outstanding, 2);
        pool.release(a)?;
        pool.release(b)?;
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 3,
                available: 3,
                outstanding: 0
            }
        );
        Ok(())
    }

    #[test]
    fn release_requires_application_ownership() -> Result<()> {
        let pool = BufferPool::new(1, 16)?;
        let mut buffer = pool.take().expect("buffer");
        buffer.set_owner(Owner::Hardware);
        assert!(pool.release(buffer).is_err());
        Ok(())
    }

    #[test]
    fn foreign_buffers_are_rejected() -> Result<()> {
        let ours = BufferPool::new(1, 16)?;
        let theirs = BufferPool::new(1, 16)?;
        let mut foreign = theirs.take().expect("buffer");
        assert!(ours.claim(&mut foreign).is_err());
        assert!(ours.release(foreign).is_err());
        Ok(())
    }

    #[test]
    fn claim_only_from_hardware_or_transit() -> Result<()> {
        let pool = BufferPool::new(1, 16)?;
        let mut buffer = pool.take().expect("buffer");
        assert!(pool.claim(&mut buffer).is_err());
        buffer.set_owner(Owner::InTransit);
        pool.claim(&mut buffer)?;
        assert_eq!(buffer.owner(), Owner::Application);
        pool.release(buffer)?;
        Ok(())
    }

    #[test]
    fn destroy_refuses_while_buffers_are_out() -> Result<()> {
        let pool = BufferPool::new(2, 16)?;
        let buffer = pool.take().expect("buffer");
        assert!(pool.destroy().is_err());
        pool.release(buffer)?;
        pool.destroy()?;
        assert!(pool.is_destroyed());
        assert!(pool.take().is_none());
        Ok(())
    }

    #[test]
    fn fill_truncates_to_capacity() -> Result<()> {
        let pool = BufferPool::new(1, 4)?;
        let mut buffer = pool.take().expect("buffer");
        assert_eq!(buffer.fill(&[1, 2, 3, 4, 5, 6], FLAG_FRAME_END), 4);
        assert_eq!(buffer.payload(), &[1, 2, 3, 4]);
        assert!(buffer.is_frame_end());
        pool.release(buffer)?;
        Ok(())
    }
}
