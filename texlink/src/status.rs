//! Engine status and the atomic cell shared with listener threads.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where the engine is in the request/response cycle.
///
/// - `Running`: the interpreter is executing and may send lines; only `read` is legal.
/// - `Waiting`: the interpreter is blocked on input; only `write` is legal.
/// - `Error`: a fault was detected. Sticky until close or restart.
/// - `Exited`: the interpreter finished cleanly. Terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    Running,
    Waiting,
    Error,
    Exited,
}

impl EngineStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Waiting => 1,
            Self::Error => 2,
            Self::Exited => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Waiting,
            2 => Self::Error,
            _ => Self::Exited,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Error => "error",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-word status flag.
///
/// Written by the owning engine, and by its listener thread (which only ever
/// stores `Error`). Stores are `Release` and loads `Acquire`, so anything the
/// listener did before flagging the error is visible to the caller that
/// observes it.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: EngineStatus) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn load(&self) -> EngineStatus {
        EngineStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: EngineStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    /// Move from `from` to `to` unless someone else changed the status first.
    /// Keeps a listener's `Error` from being overwritten by a late transition.
    pub fn transition(&self, from: EngineStatus, to: EngineStatus) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_error(&self) -> bool {
        self.load() == EngineStatus::Error
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(EngineStatus::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cell_roundtrips_every_status() {
        let cell = StatusCell::default();
        for status in [
            EngineStatus::Running,
            EngineStatus::Waiting,
            EngineStatus::Error,
            EngineStatus::Exited,
        ] {
            cell.store(status);
            assert_eq!(cell.load(), status);
        }
    }

    #[test]
    fn transition_does_not_clobber_error() {
        let cell = StatusCell::new(EngineStatus::Waiting);
        assert!(cell.transition(EngineStatus::Waiting, EngineStatus::Running));
        cell.store(EngineStatus::Error);
        assert!(!cell.transition(EngineStatus::Running, EngineStatus::Waiting));
        assert_eq!(cell.load(), EngineStatus::Error);
    }

    #[test]
    fn error_flag_visible_across_threads() {
        let cell = Arc::new(StatusCell::new(EngineStatus::Running));
        let writer = Arc::clone(&cell);
        std::thread::spawn(move || writer.store(EngineStatus::Error))
            .join()
            .unwrap();
        assert!(cell.is_error());
    }
}
