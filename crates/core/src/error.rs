//! Error taxonomy shared by engines, sessions and the async controller.
//!
//! Every condition here is recoverable; none of them should take the
//! process down.

use thiserror::Error;

/// Malformed caller-supplied button representation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("action sequence must have {expected} elements, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("unknown button: {0:?}")]
    UnknownButton(String),
}

/// Why a save-state blob was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state blob too short ({len} bytes, header needs {needed})")]
    TooShort { len: usize, needed: usize },
    #[error("state blob has wrong magic tag {found:02X?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("state payload length mismatch: header declares {declared} bytes, blob carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("state checksum mismatch")]
    ChecksumMismatch,
    #[error("state payload could not be decoded: {0}")]
    Payload(String),
    #[error("state was saved with a different ROM")]
    RomMismatch,
    #[error("state is inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to load ROM: {0}")]
    RomLoad(String),
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),
    #[error("failed to load state: {0}")]
    StateLoad(#[from] StateError),
    #[error("no ROM loaded")]
    NotReady,
    #[error("emulation fault: {0}")]
    Fault(String),
}

/// Lifecycle misuse of [`crate::AsyncController`].
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller is already running")]
    AlreadyRunning,
    #[error("controller is not running")]
    NotRunning,
    #[error("engine was lost when its thread panicked")]
    EngineLost,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_convert_into_engine_errors() {
        let err: EngineError = InputError::UnknownButton("Turbo".to_string()).into();
        assert_eq!(err.to_string(), "invalid input: unknown button: \"Turbo\"");
    }

    #[test]
    fn state_error_messages() {
        let err = StateError::UnsupportedVersion {
            found: 9,
            expected: 1,
        };
        assert_eq!(err.to_string(), "unsupported state version 9 (expected 1)");
        let err: EngineError = StateError::ChecksumMismatch.into();
        assert!(matches!(err, EngineError::StateLoad(StateError::ChecksumMismatch)));
    }
}
