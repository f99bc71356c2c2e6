//! Background listener draining the interpreter's console output.

use std::io::{self, Read, Write};
use std::process::{ChildStdin, ChildStdout};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use super::transcript::ConsoleTranscript;
use crate::name::EngineName;
use crate::status::{EngineStatus, StatusCell};

const CHUNK_BYTES: usize = 4096;

/// Interpreter stdin, shared so the listener can force-close it.
#[derive(Clone, Default)]
pub(crate) struct SharedStdin(Arc<Mutex<Option<ChildStdin>>>);

impl SharedStdin {
    pub fn new(stdin: ChildStdin) -> Self {
        Self(Arc::new(Mutex::new(Some(stdin))))
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.0.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Interpreter stdin mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Write and flush. Fails with `BrokenPipe` once the input was closed.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut slot = self.lock();
        let stdin = slot
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "interpreter input closed"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    /// Drop our end of the pipe so the interpreter sees end of input.
    pub fn close(&self) -> bool {
        self.lock().take().is_some()
    }
}

pub(crate) type SharedTranscript = Arc<Mutex<ConsoleTranscript>>;

pub(crate) fn lock_transcript(transcript: &Mutex<ConsoleTranscript>) -> MutexGuard<'_, ConsoleTranscript> {
    transcript.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Console transcript mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

/// Start the listener thread for one interpreter process.
///
/// The thread records everything into `transcript`. When a fault is detected
/// it flags `status` as error first and then closes `stdin`, so any caller
/// that sees the closed input also sees the error. It exits at end of stream.
pub(crate) fn spawn_listener(
    name: EngineName,
    pid: u32,
    mut stdout: ChildStdout,
    stdin: SharedStdin,
    status: Arc<StatusCell>,
    transcript: SharedTranscript,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("texlink-console-{pid}"))
        .spawn(move || {
            let mut buf = [0u8; CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let fault = lock_transcript(&transcript).feed(&buf[..n]);
                        if let Some(fault) = fault {
                            tracing::warn!(engine = %name, pid, fault = fault.as_str(), "Interpreter error detected");
                            status.store(EngineStatus::Error);
                            stdin.close();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(engine = %name, pid, error = %e, "Console read failed");
                        break;
                    }
                }
            }
            tracing::trace!(engine = %name, pid, "Console listener finished");
        })
}
