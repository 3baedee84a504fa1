//! Command-line arguments for both binaries.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::Overrides;
use crate::control;
use crate::output::Framing;

/// Camera settings accepted on the command line.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct CameraArgs {
    /// Stream width; height follows the capture aspect ratio.
    #[arg(short = 'w', long)]
    pub width: Option<u32>,
    /// JPEG quality (1-100).
    #[arg(short = 'q', long)]
    pub quality: Option<u32>,
    /// Annotation text (empty disables).
    #[arg(short = 'a', long, allow_hyphen_values = true)]
    pub annotation: Option<String>,
    #[arg(long)]
    pub rotation: Option<i32>,
    #[arg(long)]
    pub hflip: bool,
    #[arg(long)]
    pub vflip: bool,
    /// Exposure mode (auto, night, sports, ...).
    #[arg(long)]
    pub exposure: Option<String>,
    /// White balance mode (auto, sun, cloudy, ...).
    #[arg(long)]
    pub awb: Option<String>,
    /// Any setting as KEY=VALUE. Repeatable; a running server receives these live.
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

impl CameraArgs {
    /// `(key, value)` pairs: the dedicated flags first, then `--set` in order.
    pub fn pairs(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        let mut push = |key: &str, value: String| pairs.push((key.to_string(), value));
        if let Some(width) = self.width {
            push("width", width.to_string());
        }
        if let Some(quality) = self.quality {
            push("quality", quality.to_string());
        }
        if let Some(annotation) = &self.annotation {
            push("annotation", annotation.clone());
        }
        if let Some(rotation) = self.rotation {
            push("rotation", rotation.to_string());
        }
        if self.hflip {
            push("hflip", "on".to_string());
        }
        if self.vflip {
            push("vflip", "on".to_string());
        }
        if let Some(exposure) = &self.exposure {
            push("exposure", exposure.clone());
        }
        if let Some(awb) = &self.awb {
            push("awb", awb.clone());
        }
        for raw in &self.set {
            let (key, value) = control::parse_assignment(raw)
                .map_err(|e| anyhow!("--set {}: {}", raw, e))?;
            pairs.push((key.name().to_string(), value));
        }
        Ok(pairs)
    }

    /// The same pairs as control lines, for forwarding to a running server.
    pub fn command_lines(&self) -> Result<Vec<String>> {
        Ok(self
            .pairs()?
            .into_iter()
            .map(|(key, value)| format!("{} {}", key, value))
            .collect())
    }
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct OutputArgs {
    /// Output file; "-" writes to stdout.
    #[arg(short = 'o', long)]
    pub output: Option<String>,
    #[arg(short = 'f', long, value_enum)]
    pub framing: Option<Framing>,
    /// Frames to write before exiting (-1 = no limit).
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    pub count: Option<i64>,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "jpgstream",
    author,
    version,
    about = "Stream JPEG frames from the camera; the first instance serves, later ones subscribe"
)]
pub struct Args {
    /// TOML configuration file.
    #[arg(short = 'c', long, env = "JPGSTREAM_CONFIG")]
    pub config: Option<PathBuf>,
    /// Server socket path.
    #[arg(long)]
    pub socket: Option<PathBuf>,
    /// Lock file holding the server pid.
    #[arg(long)]
    pub lockfile: Option<PathBuf>,
    /// Become the server or fail.
    #[arg(long, conflicts_with = "client")]
    pub server: bool,
    /// Become a client or fail.
    #[arg(long)]
    pub client: bool,
    /// Ask the running server to quit.
    #[arg(long)]
    pub quit: bool,
    #[command(flatten)]
    pub output: OutputArgs,
    #[command(flatten)]
    pub camera: CameraArgs,
}

impl Args {
    pub fn overrides(&self) -> Result<Overrides> {
        Ok(Overrides {
            config: self.config.clone(),
            socket: self.socket.clone(),
            lockfile: self.lockfile.clone(),
            output: self.output.output.clone(),
            framing: self.output.framing,
            count: self.output.count,
            control_pipe: None,
            settings: self.camera.pairs()?,
        })
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "jpgstream_fifo",
    author,
    version,
    about = "Write the latest camera frame to a file, controlled through a named pipe"
)]
pub struct FifoArgs {
    /// TOML configuration file.
    #[arg(short = 'c', long, env = "JPGSTREAM_CONFIG")]
    pub config: Option<PathBuf>,
    /// Named pipe to read control commands from.
    #[arg(short = 'p', long)]
    pub control_pipe: Option<PathBuf>,
    #[command(flatten)]
    pub output: OutputArgs,
    #[command(flatten)]
    pub camera: CameraArgs,
}

impl FifoArgs {
    pub fn overrides(&self) -> Result<Overrides> {
        Ok(Overrides {
            config: self.config.clone(),
            socket: None,
            lockfile: None,
            output: self.output.output.clone(),
            framing: self.output.framing,
            count: self.output.count,
            control_pipe: self.control_pipe.clone(),
            settings: self.camera.pairs()?,
        })
    }
}
