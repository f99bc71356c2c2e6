use std::fmt;

use thiserror::Error;

use crate::status::EngineStatus;

/// Engine operation named in protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    MarkWaiting,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::MarkWaiting => "mark waiting",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation is not legal in the engine's current status. Never retried.
    #[error("cannot {operation} while engine is {status}")]
    ProtocolViolation {
        operation: Operation,
        status: EngineStatus,
    },

    #[error("default engine not set for this thread")]
    NoDefaultEngine,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Fault reported by the interpreter, message recovered from its log.
    #[error("{message}")]
    Interpreter { message: String },

    #[error("error already happened")]
    AlreadyFailed,

    /// The interpreter reached end of input without an error. Ends the session.
    #[error("interpreter process exited")]
    Exited,

    #[error("engine is already closed")]
    Closed,

    #[error("replica {replica} diverged: expected {expected:?}, got {actual:?}")]
    Divergence {
        replica: usize,
        expected: String,
        actual: String,
    },

    #[error("malformed line from interpreter: {0:?}")]
    MalformedLine(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("failed to spawn interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn interpreter(message: impl Into<String>) -> Self {
        Self::Interpreter {
            message: message.into(),
        }
    }

    pub(crate) fn violation(operation: Operation, status: EngineStatus) -> Self {
        Self::ProtocolViolation { operation, status }
    }

    /// True for the clean end-of-session signal.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_names_operation_and_status() {
        let err = EngineError::violation(Operation::Write, EngineStatus::Running);
        insta::assert_snapshot!(err.to_string(), @"cannot write while engine is running");
    }

    #[test]
    fn interpreter_error_displays_bare_message() {
        let err = EngineError::interpreter("Undefined control sequence.");
        assert_eq!(err.to_string(), "Undefined control sequence.");
        assert!(!err.is_exit());
    }

    #[test]
    fn exited_is_exit() {
        assert!(EngineError::Exited.is_exit());
    }
}
