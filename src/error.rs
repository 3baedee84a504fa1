/// Non-fatal failure of a control command.
///
/// Returned when a live command (or a startup setting) names an unknown key or carries
/// a value the key's validator rejects. `Settings` are never modified when one of
/// these is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    UnknownKey(String),
    MissingValue(String),
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ControlError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ControlError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Key the error refers to, as written by the caller.
    pub fn key(&self) -> &str {
        match self {
            ControlError::UnknownKey(key) => key,
            ControlError::MissingValue(key) => key,
            ControlError::InvalidValue { key, .. } => key,
        }
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::UnknownKey(key) => write!(f, "unknown key '{}'", key),
            ControlError::MissingValue(key) => write!(f, "key '{}' requires a value", key),
            ControlError::InvalidValue { key, value, reason } => {
                write!(f, "invalid value '{}' for '{}': {}", value, key, reason)
            }
        }
    }
}

impl std::error::Error for ControlError {}
