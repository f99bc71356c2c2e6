//! TeX interpreter run as a supervised subprocess.
//!
//! The protocol channel is the interpreter's stderr; stdin carries commands.
//! Its stdout is the console, watched by a listener thread for the error
//! prompt (see [`transcript`]). A detected fault flips the status to `error`
//! and closes stdin; the next call on the engine collects the message from
//! `texput.log`, tears the process down and raises it.

mod console;
mod spawner;
pub mod transcript;

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::GlobalConfiguration;
use crate::engine::{Engine, EngineState, OnClose};
use crate::error::{EngineError, Operation, Result};
use crate::name::EngineName;
use crate::status::EngineStatus;

use console::{SharedStdin, SharedTranscript, lock_transcript, spawn_listener};
use spawner::{kill_tree, wait_timeout};
pub use spawner::{LISTEN_DIRECTIVE, LatexSpawner, ProcessSpawner, SpawnRequest};
use transcript::extract_error_message;

/// Jobname TeX uses when reading from the terminal.
pub const JOB_NAME: &str = "texput";

pub const DIRECTORY_PREFIX: &str = "texlink-";

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How to start (and restart) a child interpreter.
#[derive(Clone)]
pub struct ChildProcessConfig {
    pub name: EngineName,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Replace the process after an interpreter error instead of failing
    /// every later call. Prior state is not replayed.
    pub autorestart: bool,
    /// Written as-is right after the process starts.
    pub bootstrap: Option<Vec<u8>>,
    /// Written on close if the interpreter is waiting for input.
    pub shutdown_payload: Option<Vec<u8>>,
    pub global: GlobalConfiguration,
    pub wait_timeout: Duration,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl ChildProcessConfig {
    pub fn new(name: EngineName) -> Self {
        Self {
            name,
            args: Vec::new(),
            env: Vec::new(),
            autorestart: false,
            bootstrap: None,
            shutdown_payload: None,
            global: GlobalConfiguration::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            spawner: Arc::new(LatexSpawner),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_autorestart(mut self, autorestart: bool) -> Self {
        self.autorestart = autorestart;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<Vec<u8>>) -> Self {
        self.bootstrap = Some(bootstrap.into());
        self
    }

    pub fn with_shutdown_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.shutdown_payload = Some(payload.into());
        self
    }

    pub fn with_global(mut self, global: GlobalConfiguration) -> Self {
        self.global = global;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl fmt::Debug for ChildProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessConfig")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("autorestart", &self.autorestart)
            .field("global", &self.global)
            .finish_non_exhaustive()
    }
}

/// One running interpreter process and everything tied to its lifetime.
struct Session {
    directory: TempDir,
    child: Child,
    stdin: SharedStdin,
    protocol: BufReader<ChildStderr>,
    transcript: SharedTranscript,
    listener: Option<JoinHandle<()>>,
    reaped: bool,
}

impl Session {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn file_path(&self, extension: &str) -> PathBuf {
        self.directory.path().join(format!("{JOB_NAME}.{extension}"))
    }

    fn join_listener(&mut self) {
        if let Some(listener) = self.listener.take()
            && listener.join().is_err()
        {
            tracing::error!(pid = self.pid(), "Console listener panicked");
        }
    }

    /// Wait for the process to exit, killing it after `timeout`, then join
    /// the listener. Safe to call more than once.
    fn reap(&mut self, timeout: Duration) {
        if !self.reaped {
            let pid = self.pid();
            match wait_timeout(&mut self.child, timeout) {
                Ok(Some(status)) => tracing::debug!(pid, %status, "Interpreter exited"),
                Ok(None) => {
                    tracing::warn!(pid, ?timeout, "Interpreter did not exit, killing");
                    self.kill();
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for interpreter, killing");
                    self.kill();
                }
            }
            self.reaped = true;
        }
        self.join_listener();
    }

    fn kill(&mut self) {
        if let Err(e) = kill_tree(&mut self.child) {
            tracing::warn!(pid = self.pid(), error = %e, "Failed to kill interpreter");
        }
        if let Err(e) = self.child.wait() {
            tracing::warn!(pid = self.pid(), error = %e, "Failed to reap interpreter");
        }
    }

    /// Optionally send `farewell`, close stdin and reap.
    fn shut_down(&mut self, farewell: Option<&[u8]>, timeout: Duration) {
        if let Some(payload) = farewell
            && let Err(e) = self.stdin.write_all(payload)
        {
            tracing::debug!(pid = self.pid(), error = %e, "Shutdown payload not delivered");
        }
        self.stdin.close();
        self.reap(timeout);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.reaped {
            self.shut_down(None, Duration::ZERO);
        }
    }
}

/// Interpreter process driven over its stdin/stderr.
///
/// ```no_run
/// use texlink::{ChildProcessConfig, ChildProcessEngine, Engine, EngineName};
///
/// let mut engine = ChildProcessEngine::start(ChildProcessConfig::new(EngineName::PdfTex))?;
/// engine.write(b"...\n")?;
/// let line = engine.read()?;
/// # Ok::<(), texlink::EngineError>(())
/// ```
pub struct ChildProcessEngine {
    state: EngineState,
    config: ChildProcessConfig,
    session: Option<Session>,
}

impl ChildProcessEngine {
    pub fn start(config: ChildProcessConfig) -> Result<Self> {
        let state = EngineState::new(config.name, config.global.clone(), EngineStatus::Waiting);
        let mut engine = Self {
            state,
            config,
            session: None,
        };
        engine.spawn_session()?;
        Ok(engine)
    }

    fn spawn_session(&mut self) -> Result<()> {
        let name = self.config.name;
        let directory = tempfile::Builder::new()
            .prefix(DIRECTORY_PREFIX)
            .tempdir()
            .map_err(EngineError::Spawn)?;

        let request = SpawnRequest {
            name,
            args: &self.config.args,
            env: &self.config.env,
            directory: directory.path(),
        };
        let mut child = self.config.spawner.spawn(&request).map_err(EngineError::Spawn)?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = kill_tree(&mut child);
            let _ = child.wait();
            return Err(EngineError::Spawn(io::Error::other(
                "spawner must pipe stdin, stdout and stderr",
            )));
        };

        // Before the listener exists, so it can only ever move us to error.
        self.state.set_status(EngineStatus::Waiting);

        let stdin = SharedStdin::new(stdin);
        let transcript = SharedTranscript::default();
        let listener = match spawn_listener(
            name,
            pid,
            stdout,
            stdin.clone(),
            self.state.status_cell(),
            Arc::clone(&transcript),
        ) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = kill_tree(&mut child);
                let _ = child.wait();
                return Err(EngineError::Spawn(e));
            }
        };

        tracing::info!(
            engine = %name,
            pid,
            directory = %directory.path().display(),
            "Interpreter started"
        );

        let session = Session {
            directory,
            child,
            stdin,
            protocol: BufReader::new(stderr),
            transcript,
            listener: Some(listener),
            reaped: false,
        };
        let session = self.session.insert(session);

        if let Some(bootstrap) = &self.config.bootstrap {
            tracing::debug!(engine = %name, pid, bytes = bootstrap.len(), "Writing bootstrap");
            session.stdin.write_all(bootstrap)?;
        }
        Ok(())
    }

    /// Discard the current process and start a fresh one in `waiting`.
    pub fn restart(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            tracing::info!(engine = %self.config.name, pid = session.pid(), "Restarting interpreter");
            session.shut_down(None, self.config.wait_timeout);
        }
        self.spawn_session()
    }

    /// Surface an error flagged by the listener.
    ///
    /// The first call after a fault tears the process down and raises the
    /// message from the log (restarting first when configured). Without
    /// autorestart later calls raise [`EngineError::AlreadyFailed`].
    fn check_no_error(&mut self) -> Result<()> {
        if self.state.status() != EngineStatus::Error {
            return Ok(());
        }
        let Some(mut session) = self.session.take() else {
            return Err(EngineError::AlreadyFailed);
        };

        session.shut_down(None, self.config.wait_timeout);
        let log = std::fs::read(session.file_path("log")).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "No interpreter log");
            Vec::new()
        });
        let message = extract_error_message(&log);
        tracing::warn!(engine = %self.config.name, pid = session.pid(), %message, "Interpreter error");
        drop(session);

        if self.config.autorestart {
            self.spawn_session()?;
        }
        Err(EngineError::interpreter(message))
    }

    /// Next raw line from the protocol channel, newline included.
    fn read_raw(&mut self) -> Result<Vec<u8>> {
        self.check_no_error()?;
        let session = self.session.as_mut().ok_or(EngineError::Closed)?;

        let mut raw = Vec::new();
        let read = session.protocol.read_until(b'\n', &mut raw);
        match read {
            Ok(0) => {
                session.reap(self.config.wait_timeout);
                self.check_no_error()?;
                self.finish_exited()?;
                Err(EngineError::Exited)
            }
            Ok(_) => {
                self.check_no_error()?;
                Ok(raw)
            }
            Err(e) => {
                self.check_no_error()?;
                Err(e.into())
            }
        }
    }

    fn finish_exited(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.shut_down(None, self.config.wait_timeout);
        }
        tracing::info!(engine = %self.config.name, "Interpreter reached end of input");
        self.state.set_status(EngineStatus::Exited);
        if self.config.autorestart {
            self.spawn_session()?;
        }
        Ok(())
    }

    /// Read one line regardless of status. Replicas are driven this way by
    /// the multi engine, which keeps the state machine itself.
    pub(crate) fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            let raw = self.read_raw()?;
            if let Some(line) = self.state.accept_line(raw)? {
                self.state.trace_incoming(&line);
                return Ok(line);
            }
        }
    }

    /// Write regardless of status. See [`Self::read_line`].
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_no_error()?;
        let session = self.session.as_ref().ok_or(EngineError::Closed)?;
        self.state.trace_outgoing(data);
        if let Err(e) = session.stdin.write_all(data) {
            return Err(self.input_lost(e));
        }
        Ok(())
    }

    /// The interpreter stopped accepting input. Reap it; report the fault the
    /// listener saw, or else fail with the transport error.
    fn input_lost(&mut self, error: io::Error) -> EngineError {
        if let Some(session) = self.session.as_mut() {
            session.stdin.close();
            session.reap(self.config.wait_timeout);
        }
        if let Err(fault) = self.check_no_error() {
            return fault;
        }
        if let Some(mut session) = self.session.take() {
            tracing::warn!(
                engine = %self.config.name,
                pid = session.pid(),
                error = %error,
                "Interpreter input closed unexpectedly"
            );
            session.shut_down(None, self.config.wait_timeout);
        }
        self.state.set_status(EngineStatus::Error);
        EngineError::Transport(error)
    }

    /// Take over `status` from the owner, unless the listener already
    /// flagged an error.
    pub(crate) fn adopt_status(&self, status: EngineStatus) {
        let current = self.state.status();
        if current != EngineStatus::Error {
            self.state.status_cell().transition(current, status);
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(EngineError::Closed)
    }

    /// Working directory of the current process.
    pub fn directory(&self) -> Result<&Path> {
        Ok(self.session()?.directory.path())
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().map(Session::pid)
    }

    /// Contents of `texput.log`.
    pub fn read_log(&self) -> Result<Vec<u8>> {
        self.read_output_file("log")
    }

    /// Contents of `texput.<extension>`, e.g. `pdf` once the document ended.
    pub fn read_output_file(&self, extension: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.session()?.file_path(extension))?)
    }

    /// Console lines printed so far by the current process.
    pub fn console_lines(&self) -> Vec<String> {
        self.session
            .as_ref()
            .map(|session| lock_transcript(&session.transcript).lines())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }
}

impl Engine for ChildProcessEngine {
    fn name(&self) -> EngineName {
        self.state.name()
    }

    fn config(&self) -> GlobalConfiguration {
        self.state.config().clone()
    }

    fn status(&self) -> EngineStatus {
        self.state.status()
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        self.check_no_error()?;
        self.state.ensure(Operation::Read)?;
        self.read_line()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_no_error()?;
        self.state.ensure(Operation::Write)?;
        self.send(data)?;
        self.state.wrote();
        Ok(())
    }

    fn mark_waiting(&mut self) -> Result<()> {
        self.state.mark_waiting()
    }

    fn add_on_close(&mut self, hook: OnClose) -> Result<()> {
        self.state.add_on_close(hook);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            let status = self.state.status();
            // Only an interpreter waiting for input can wind down on its own.
            let (farewell, timeout) = match status {
                EngineStatus::Waiting => (
                    self.config.shutdown_payload.as_deref(),
                    self.config.wait_timeout,
                ),
                _ => (None, Duration::ZERO),
            };
            tracing::debug!(engine = %self.config.name, pid = session.pid(), %status, "Closing interpreter");
            session.shut_down(farewell, timeout);
            if status != EngineStatus::Error {
                self.state.set_status(EngineStatus::Exited);
            }
        }
        self.state.run_on_close();
        Ok(())
    }
}

impl fmt::Display for ChildProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = format!("ChildProcessEngine('{}')", self.state.name());
        if self.state.status() == EngineStatus::Error {
            write!(f, "<{repr} error>")
        } else if self.session.is_none() {
            write!(f, "<{repr} closed>")
        } else {
            f.write_str(&repr)
        }
    }
}

impl fmt::Debug for ChildProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessEngine")
            .field("name", &self.state.name())
            .field("status", &self.state.status())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Drop for ChildProcessEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(engine = %self.config.name, error = %e, "Failed to close interpreter");
        }
    }
}
