//! Startup configuration.
//!
//! Sources, lowest precedence first:
//! - built-in defaults
//! - `JPGSTREAM_*` environment variables
//! - the TOML file named by `--config` or `JPGSTREAM_CONFIG`
//! - command-line flags
//!
//! Each value is range-checked as it is read. Checks spanning several keys (the
//! derived stream height) run once on the merged result.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::assembler::MAX_FRAME_BYTES;
use crate::distributor::MAX_DATAGRAM;
use crate::output::{Framing, OutputTarget};
use crate::settings::{ParamKey, Settings};

pub const DEFAULT_SOCKET: &str = "/tmp/jpgstream_socket";
pub const DEFAULT_LOCKFILE: &str = "/tmp/jpgstream_lock";
pub const DEFAULT_CONTROL_PIPE: &str = "/tmp/jpgstream_fifo";

const ENV_CONFIG: &str = "JPGSTREAM_CONFIG";
const ENV_SOCKET: &str = "JPGSTREAM_SOCKET";
const ENV_LOCKFILE: &str = "JPGSTREAM_LOCKFILE";
const ENV_OUTPUT: &str = "JPGSTREAM_OUTPUT";
const ENV_FRAMING: &str = "JPGSTREAM_FRAMING";
const ENV_COUNT: &str = "JPGSTREAM_COUNT";
const ENV_CONTROL_PIPE: &str = "JPGSTREAM_CONTROL_PIPE";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct JpgstreamConfigFile {
    socket: Option<PathBuf>,
    lockfile: Option<PathBuf>,
    output: Option<String>,
    framing: Option<Framing>,
    count: Option<i64>,
    control_pipe: Option<PathBuf>,
    max_frame_bytes: Option<usize>,
    camera: Option<toml::Table>,
}

/// Values given on the command line. Highest precedence below live commands.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub lockfile: Option<PathBuf>,
    pub output: Option<String>,
    pub framing: Option<Framing>,
    pub count: Option<i64>,
    pub control_pipe: Option<PathBuf>,
    /// `(key, value)` pairs in the order given; later pairs win.
    pub settings: Vec<(String, String)>,
}

/// Fully resolved startup configuration.
///
/// Precedence, highest first: command line, config file, environment
/// (`JPGSTREAM_*`), built-in defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: Settings,
    pub socket: PathBuf,
    pub lockfile: PathBuf,
    pub output: Option<OutputTarget>,
    /// Unset means each binary's own default.
    pub framing: Option<Framing>,
    /// Frames to produce before exiting; `None` runs until stopped.
    pub count: Option<u64>,
    pub control_pipe: PathBuf,
    pub max_frame_bytes: usize,
    pub config_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            socket: PathBuf::from(DEFAULT_SOCKET),
            lockfile: PathBuf::from(DEFAULT_LOCKFILE),
            output: None,
            framing: None,
            count: None,
            control_pipe: PathBuf::from(DEFAULT_CONTROL_PIPE),
            max_frame_bytes: MAX_FRAME_BYTES,
            config_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn load(cli: &Overrides) -> Result<Self> {
        let config_path = cli.config.clone().or_else(|| env_path(ENV_CONFIG));
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::default();
        cfg.apply_env()?;
        if let (Some(file), Some(path)) = (file_cfg, config_path.as_deref()) {
            cfg.apply_file(file, path)?;
        }
        cfg.config_path = config_path;
        cfg.apply_cli(cli)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_path(ENV_SOCKET) {
            self.socket = path;
        }
        if let Some(path) = env_path(ENV_LOCKFILE) {
            self.lockfile = path;
        }
        if let Some(path) = env_path(ENV_CONTROL_PIPE) {
            self.control_pipe = path;
        }
        if let Ok(output) = std::env::var(ENV_OUTPUT) {
            self.output = OutputTarget::parse(&output);
        }
        if let Some(framing) = env_value(ENV_FRAMING) {
            self.framing = Some(
                framing
                    .parse()
                    .map_err(|e| anyhow!("{} is invalid: {}", ENV_FRAMING, e))?,
            );
        }
        if let Some(count) = env_value(ENV_COUNT) {
            let count: i64 = count
                .parse()
                .map_err(|_| anyhow!("{} must be an integer frame count", ENV_COUNT))?;
            self.count = frame_count(count);
        }
        for key in ParamKey::ALL {
            let var = key.env_var();
            if let Ok(value) = std::env::var(&var) {
                key.store(&mut self.settings, &value)
                    .map_err(|e| anyhow!("environment {}: {}", var, e))?;
            }
        }
        Ok(())
    }

    fn apply_file(&mut self, file: JpgstreamConfigFile, path: &Path) -> Result<()> {
        if let Some(socket) = file.socket {
            self.socket = socket;
        }
        if let Some(lockfile) = file.lockfile {
            self.lockfile = lockfile;
        }
        if let Some(output) = file.output {
            self.output = OutputTarget::parse(&output);
        }
        if file.framing.is_some() {
            self.framing = file.framing;
        }
        if let Some(count) = file.count {
            self.count = frame_count(count);
        }
        if let Some(control_pipe) = file.control_pipe {
            self.control_pipe = control_pipe;
        }
        if let Some(max_frame_bytes) = file.max_frame_bytes {
            self.max_frame_bytes = max_frame_bytes;
        }
        for (name, value) in file.camera.unwrap_or_default() {
            let raw = toml_scalar(&value).ok_or_else(|| {
                anyhow!(
                    "{}: camera.{} must be a string, number or boolean",
                    path.display(),
                    name
                )
            })?;
            set_named(&mut self.settings, &name, &raw)
                .map_err(|e| anyhow!("{}: {}", path.display(), e))?;
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &Overrides) -> Result<()> {
        if let Some(socket) = &cli.socket {
            self.socket = socket.clone();
        }
        if let Some(lockfile) = &cli.lockfile {
            self.lockfile = lockfile.clone();
        }
        if let Some(output) = &cli.output {
            self.output = OutputTarget::parse(output);
        }
        if cli.framing.is_some() {
            self.framing = cli.framing;
        }
        if let Some(count) = cli.count {
            self.count = frame_count(count);
        }
        if let Some(control_pipe) = &cli.control_pipe {
            self.control_pipe = control_pipe.clone();
        }
        for (name, value) in &cli.settings {
            set_named(&mut self.settings, name, value)
                .map_err(|e| anyhow!("command line: {}", e))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.settings
            .validate()
            .map_err(|e| anyhow!("invalid settings: {}", e))?;
        if self.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be greater than zero"));
        }
        if self.max_frame_bytes > MAX_DATAGRAM {
            return Err(anyhow!(
                "max_frame_bytes {} exceeds the {} byte subscriber datagram limit",
                self.max_frame_bytes,
                MAX_DATAGRAM
            ));
        }
        if self.framing == Some(Framing::Replace) && self.output == Some(OutputTarget::Stdout) {
            return Err(anyhow!("replace framing needs a file output, not stdout"));
        }
        Ok(())
    }
}

fn set_named(settings: &mut Settings, name: &str, value: &str) -> Result<()> {
    let key = ParamKey::parse(name).map_err(|e| anyhow!("{}", e))?;
    key.store(settings, value).map_err(|e| anyhow!("{}", e))
}

fn frame_count(count: i64) -> Option<u64> {
    u64::try_from(count).ok()
}

fn toml_scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(if *b { "on" } else { "off" }.to_string()),
        _ => None,
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_value(name).map(PathBuf::from)
}

fn read_config_file(path: &Path) -> Result<JpgstreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}
