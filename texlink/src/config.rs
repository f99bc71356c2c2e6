//! Configuration shared between the controller and the processes the
//! interpreter spawns. Transmitted once through the handshake line.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::communicate::Communicator;

/// Placeholder in [`GlobalConfiguration::debug_log_communication`] replaced
/// by the process id, so concurrent processes log to separate files.
pub const PID_PLACEHOLDER: &str = "$pid";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfiguration {
    /// Verbosity in `0..=9`. At 5 and above every protocol line is traced.
    pub debug: u8,
    /// Some TeX distributions do not flush their output; the TeX side then
    /// pads its writes and emits flush sentinel lines that readers discard.
    pub naive_flush: bool,
    /// Log every exchanged line to this path (`$pid` is substituted).
    pub debug_log_communication: Option<String>,
    /// Sending half of the reverse channel, when one was set up.
    pub communicator: Option<Communicator>,
}

impl GlobalConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug(mut self, level: u8) -> Self {
        self.debug = level.min(9);
        self
    }

    pub fn with_naive_flush(mut self, naive_flush: bool) -> Self {
        self.naive_flush = naive_flush;
        self
    }

    pub fn with_communication_log(mut self, path: impl Into<String>) -> Self {
        self.debug_log_communication = Some(path.into());
        self
    }

    pub fn with_communicator(mut self, communicator: Communicator) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Whether individual protocol lines should be traced.
    pub fn traces_lines(&self) -> bool {
        self.debug >= 5
    }

    /// Communication log path for the current process.
    pub fn communication_log_path(&self) -> Option<PathBuf> {
        self.debug_log_communication.as_ref().map(|template| {
            PathBuf::from(template.replace(PID_PLACEHOLDER, &std::process::id().to_string()))
        })
    }
}
