//! Frame output.
//!
//! A `FrameSink` receives every assembled frame. `FrameWriter` is the file/stdout
//! sink with one of four framings:
//! - `cat`: frames back to back
//! - `mime`: `multipart/x-mixed-replace` parts
//! - `header`: 4-byte big-endian length, then the frame
//! - `replace`: each frame written to `<path>.part` then renamed over `<path>`

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

pub const MIME_BOUNDARY: &str = "jpgstreamframe";

/// Consumer of complete frames.
pub trait FrameSink: Send {
    fn emit(&mut self, frame: &[u8]) -> Result<()>;
}

/// One sink handed to successive graph generations.
impl<S: FrameSink> FrameSink for Arc<Mutex<S>> {
    fn emit(&mut self, frame: &[u8]) -> Result<()> {
        self.lock()
            .map_err(|_| anyhow!("frame sink lock poisoned"))?
            .emit(frame)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Cat,
    Mime,
    Header,
    Replace,
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Framing::Cat => "cat",
            Framing::Mime => "mime",
            Framing::Header => "header",
            Framing::Replace => "replace",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Framing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cat" => Ok(Framing::Cat),
            "mime" => Ok(Framing::Mime),
            "header" => Ok(Framing::Header),
            "replace" => Ok(Framing::Replace),
            other => Err(anyhow!("unknown framing: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    /// `-` means stdout; empty means no output.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "-" => Some(OutputTarget::Stdout),
            path => Some(OutputTarget::File(PathBuf::from(path))),
        }
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "-"),
            OutputTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

enum Stream {
    Stdout(std::io::Stdout),
    File(File),
    Replace { path: PathBuf, part: PathBuf },
}

pub struct FrameWriter {
    framing: Framing,
    stream: Stream,
    frames: u64,
}

impl FrameWriter {
    pub fn open(target: &OutputTarget, framing: Framing) -> Result<Self> {
        let stream = match (target, framing) {
            (OutputTarget::Stdout, Framing::Replace) => {
                return Err(anyhow!("replace framing needs a file output, not stdout"))
            }
            (OutputTarget::Stdout, _) => Stream::Stdout(std::io::stdout()),
            (OutputTarget::File(path), Framing::Replace) => Stream::Replace {
                path: path.clone(),
                part: part_path(path),
            },
            (OutputTarget::File(path), _) => Stream::File(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("failed to open output {}", path.display()))?,
            ),
        };
        Ok(Self {
            framing,
            stream,
            frames: 0,
        })
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        match &mut self.stream {
            Stream::Stdout(stdout) => {
                let mut lock = stdout.lock();
                write_framed(&mut lock, self.framing, frame)?;
                lock.flush()?;
            }
            Stream::File(file) => {
                write_framed(file, self.framing, frame)?;
                file.flush()?;
            }
            Stream::Replace { path, part } => replace_file(path, part, frame)?,
        }
        self.frames += 1;
        Ok(())
    }
}

impl FrameSink for FrameWriter {
    fn emit(&mut self, frame: &[u8]) -> Result<()> {
        self.write_frame(frame)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn write_framed<W: Write>(out: &mut W, framing: Framing, frame: &[u8]) -> Result<()> {
    match framing {
        Framing::Cat | Framing::Replace => out.write_all(frame)?,
        Framing::Mime => {
            write!(
                out,
                "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                MIME_BOUNDARY,
                frame.len()
            )?;
            out.write_all(frame)?;
            out.write_all(b"\r\n")?;
        }
        Framing::Header => {
            let len = u32::try_from(frame.len())
                .map_err(|_| anyhow!("frame of {} bytes too large for header framing", frame.len()))?;
            out.write_all(&len.to_be_bytes())?;
            out.write_all(frame)?;
        }
    }
    Ok(())
}

fn replace_file(path: &Path, part: &Path, frame: &[u8]) -> Result<()> {
    let mut file = File::create(part)
        .with_context(|| format!("failed to create {}", part.display()))?;
    file.write_all(frame)
        .with_context(|| format!("failed to write {}", part.display()))?;
    drop(file);
    std::fs::rename(part, path)
        .with_context(|| format!("failed to rename {} to {}", part.display(), path.display()))
}

// ---- Frame budget ----

/// Remaining-frame counter shared between the control loop and a sink running on a
/// hardware thread. Negative means unlimited.
#[derive(Clone, Debug)]
pub struct FrameBudget {
    remaining: Arc<AtomicI64>,
}

impl FrameBudget {
    pub fn new(count: Option<u64>) -> Self {
        let start = count.map(|c| c.min(i64::MAX as u64) as i64).unwrap_or(-1);
        Self {
            remaining: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Counts one emitted frame. Returns false once the budget was already spent.
    pub fn consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                n if n < 0 => Some(n),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    pub fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    pub fn remaining(&self) -> Option<u64> {
        let n = self.remaining.load(Ordering::Acquire);
        (n >= 0).then_some(n as u64)
    }
}

/// Sink wrapper that stops forwarding once the budget is spent.
pub struct BudgetedSink<S> {
    inner: S,
    budget: FrameBudget,
}

impl<S: FrameSink> BudgetedSink<S> {
    pub fn new(inner: S, budget: FrameBudget) -> Self {
        Self { inner, budget }
    }
}

impl<S: FrameSink> FrameSink for BudgetedSink<S> {
    fn emit(&mut self, frame: &[u8]) -> Result<()> {
        if self.budget.consume() {
            self.inner.emit(frame)?;
        }
        Ok(())
    }
}
