//! Control commands.
//!
//! Commands arrive one per line from the control pipe or a subscriber datagram:
//!
//! ```text
//! # comment
//! quality 50
//! exposure=night
//! hflip
//! run 0
//! quit
//! ```
//!
//! A line is `key value`, `key=value` or a bare key. Lines starting with `#` and
//! blank lines are ignored. Parsing only resolves the key; values are validated when
//! the command is applied.

use crate::error::ControlError;
use crate::settings::{parse_bool, KeyClass, ParamKey, Settings};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Set { key: ParamKey, value: String },
    Run(bool),
    Quit,
}

impl Command {
    /// Name used in acknowledgements.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Set { key, .. } => key.name(),
            Command::Run(_) => "run",
            Command::Quit => "quit",
        }
    }
}

/// Where a setting comes from. Startup sources are trusted to be correct and fail
/// hard; runtime sources are skipped with a warning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyContext {
    Startup,
    Runtime,
}

/// What the control loop has to do after a command was applied to `Settings`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    /// Re-issue the key's hardware parameter on the running graph.
    Reconfigure(ParamKey),
    /// Tear the graph down and build it again.
    Rebuild,
    Stop,
    Resume,
    Quit,
}

/// Parses one line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<Command>, ControlError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let split = line
        .char_indices()
        .find(|(_, c)| *c == '=' || c.is_whitespace());
    let (name, value) = match split {
        Some((i, sep)) => {
            let rest = line[i + sep.len_utf8()..].trim();
            // `key = value`
            let rest = match (sep, rest.strip_prefix('=')) {
                ('=', _) | (_, None) => rest,
                (_, Some(stripped)) => stripped.trim(),
            };
            (&line[..i], Some(rest))
        }
        None => (line, None),
    };

    match name.to_ascii_lowercase().as_str() {
        "quit" => return Ok(Some(Command::Quit)),
        "run" => {
            let run = match value {
                None => true,
                Some(raw) => parse_bool("run", raw)?,
            };
            return Ok(Some(Command::Run(run)));
        }
        _ => {}
    }

    let key = ParamKey::parse(name)?;
    let value = match value {
        Some(value) => value.to_string(),
        None => key
            .bare_value()
            .ok_or_else(|| ControlError::MissingValue(key.name().to_string()))?
            .to_string(),
    };
    Ok(Some(Command::Set { key, value }))
}

/// Parses every line of `text`, keeping per-line failures.
pub fn parse_text(text: &str) -> Vec<Result<Command, ControlError>> {
    text.lines().filter_map(|line| parse_line(line).transpose()).collect()
}

/// Parses a `key=value` assignment given on the command line.
pub fn parse_assignment(raw: &str) -> Result<(ParamKey, String), ControlError> {
    match parse_line(raw)? {
        Some(Command::Set { key, value }) => Ok((key, value)),
        Some(other) => Err(ControlError::invalid(
            other.label(),
            raw,
            "not a settings key",
        )),
        None => Err(ControlError::MissingValue(raw.to_string())),
    }
}

/// Applies `command` to `settings`. On error `settings` is unchanged.
pub fn apply(settings: &mut Settings, command: &Command) -> Result<Action, ControlError> {
    match command {
        Command::Quit => Ok(Action::Quit),
        Command::Run(true) => Ok(Action::Resume),
        Command::Run(false) => Ok(Action::Stop),
        Command::Set { key, value } => {
            let before = settings.clone();
            key.set(settings, value)?;
            match key.class() {
                KeyClass::Parameter => Ok(Action::Reconfigure(*key)),
                KeyClass::Resolution if *settings == before => Ok(Action::None),
                KeyClass::Resolution => Ok(Action::Rebuild),
            }
        }
    }
}

/// Status text returned to whoever sent a command.
pub fn acknowledgement(label: &str, result: &Result<Action, ControlError>) -> String {
    match result {
        Ok(_) => format!("ok {}", label),
        Err(e) => format!("error: {}", e),
    }
}
