//! Reassembly of compressed frames fragmented across pool buffers.
//!
//! The assembler keeps one pending frame per output port:
//! - a frame that arrives whole in an empty assembler is passed through borrowed
//! - fragments are appended until a frame-end fragment completes the frame
//! - a frame that outgrows the ceiling is dropped, and everything up to and including
//!   its frame-end fragment is discarded

/// Default ceiling for one assembled frame.
pub const MAX_FRAME_BYTES: usize = 65536;

/// Result of feeding one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum Assembly<'a> {
    /// More fragments are needed (or the current frame is being discarded).
    Pending,
    /// A complete frame; valid until the next call on the assembler.
    Complete(&'a [u8]),
    /// The in-progress frame exceeded the ceiling and was dropped.
    Dropped { size: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub fast_path: u64,
}

pub struct FrameAssembler {
    pending: Vec<u8>,
    max_frame: usize,
    discarding: bool,
    emitted: bool,
    stats: AssemblerStats,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameAssembler {
    pub fn new(max_frame: usize) -> Self {
        Self {
            pending: Vec::with_capacity(max_frame),
            max_frame,
            discarding: false,
            emitted: false,
            stats: AssemblerStats::default(),
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Bytes accumulated for the frame in progress.
    pub fn pending_len(&self) -> usize {
        if self.emitted {
            0
        } else {
            self.pending.len()
        }
    }

    /// Discards any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.discarding = false;
        self.emitted = false;
    }

    pub fn push<'a>(&'a mut self, fragment: &'a [u8], frame_end: bool) -> Assembly<'a> {
        if self.emitted {
            self.pending.clear();
            self.emitted = false;
        }

        if self.discarding {
            if frame_end {
                self.discarding = false;
            }
            return Assembly::Pending;
        }

        if self.pending.is_empty() && frame_end && fragment.len() <= self.max_frame {
            self.stats.fast_path += 1;
            self.stats.frames_emitted += 1;
            return Assembly::Complete(fragment);
        }

        let size = self.pending.len() + fragment.len();
        if size > self.max_frame {
            self.pending.clear();
            self.discarding = !frame_end;
            self.stats.frames_dropped += 1;
            log::warn!(
                "frame of at least {} bytes exceeds the {} byte limit; dropped",
                size,
                self.max_frame
            );
            return Assembly::Dropped { size };
        }

        self.pending.extend_from_slice(fragment);
        if frame_end {
            self.emitted = true;
            self.stats.frames_emitted += 1;
            return Assembly::Complete(&self.pending);
        }
        Assembly::Pending
    }
}
