//! Engine contract and the state machine every implementation shares.
//!
//! The interpreter and the controller take turns: a `write` hands control to
//! the interpreter (`waiting` → `running`), `read` collects the lines it sends
//! while running, and [`Engine::mark_waiting`] records that it has blocked on
//! input again. Out-of-turn calls are [`EngineError::ProtocolViolation`]s.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::GlobalConfiguration;
use crate::error::{EngineError, Operation, Result};
use crate::name::EngineName;
use crate::status::{EngineStatus, StatusCell};

/// Reserved line the TeX side emits in naive-flush mode. Carries no data.
pub const NAIVE_FLUSH_LINE: &[u8] = b"pythonimmediate-naive-flush-line";

/// Longest prefix of a protocol line included in trace output.
const TRACE_PREVIEW_CHARS: usize = 100;

/// Engine handle that can be shared with the thread-local default slot.
pub type SharedEngine = Arc<Mutex<dyn Engine>>;

/// Callback run once when an engine is closed by its owner.
pub type OnClose = Box<dyn FnOnce() + Send>;

/// One running instance of the interpreter, exposing line-based read/write.
pub trait Engine: Send {
    fn name(&self) -> EngineName;

    fn config(&self) -> GlobalConfiguration;

    fn status(&self) -> EngineStatus;

    fn is_unicode(&self) -> bool {
        self.name().is_unicode()
    }

    /// Read one line sent by the interpreter, without its trailing newline.
    ///
    /// Legal only while `running`.
    fn read(&mut self) -> Result<Vec<u8>>;

    /// Send data to the interpreter. It only consumes whole lines, so `data`
    /// should be newline-terminated.
    ///
    /// Legal only while `waiting`; moves to `running`.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Record that the interpreter is blocked waiting for input.
    ///
    /// Legal only while `running`; moves to `waiting`.
    fn mark_waiting(&mut self) -> Result<()>;

    /// Register a callback run once when the engine is closed.
    fn add_on_close(&mut self, hook: OnClose) -> Result<()>;

    /// Release the interpreter and everything the engine owns. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Wrap an engine for use with [`crate::default_engine::set_engine`].
///
/// `Arc<Mutex<E>>` coerces to [`SharedEngine`] while keeping the concrete
/// type available to the caller.
pub fn shared<E: Engine + 'static>(engine: E) -> Arc<Mutex<E>> {
    Arc::new(Mutex::new(engine))
}

/// Lock an engine mutex. On poison: logs error and recovers the inner value;
/// the engine's own status still reflects whatever state it was left in.
pub(crate) fn lock_engine<E: ?Sized>(engine: &Mutex<E>) -> MutexGuard<'_, E> {
    match engine.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Engine mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Identity, configuration, status and close hooks of one engine.
pub(crate) struct EngineState {
    name: EngineName,
    config: GlobalConfiguration,
    status: Arc<StatusCell>,
    on_close: Vec<OnClose>,
}

impl EngineState {
    pub fn new(name: EngineName, config: GlobalConfiguration, status: EngineStatus) -> Self {
        Self {
            name,
            config,
            status: Arc::new(StatusCell::new(status)),
            on_close: Vec::new(),
        }
    }

    pub fn name(&self) -> EngineName {
        self.name
    }

    pub fn config(&self) -> &GlobalConfiguration {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.status.load()
    }

    pub fn set_status(&self, status: EngineStatus) {
        self.status.store(status);
    }

    /// Handle for threads that may flag an error asynchronously.
    pub fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// Check that `operation` is legal right now.
    pub fn ensure(&self, operation: Operation) -> Result<()> {
        let expected = match operation {
            Operation::Read | Operation::MarkWaiting => EngineStatus::Running,
            Operation::Write => EngineStatus::Waiting,
        };
        match self.status() {
            status if status == expected => Ok(()),
            EngineStatus::Error => Err(EngineError::AlreadyFailed),
            status => Err(EngineError::violation(operation, status)),
        }
    }

    /// `waiting` → `running` after a successful write.
    pub fn wrote(&self) {
        self.status
            .transition(EngineStatus::Waiting, EngineStatus::Running);
    }

    pub fn mark_waiting(&self) -> Result<()> {
        self.ensure(Operation::MarkWaiting)?;
        if self
            .status
            .transition(EngineStatus::Running, EngineStatus::Waiting)
        {
            Ok(())
        } else {
            Err(EngineError::AlreadyFailed)
        }
    }

    /// Validate a raw line. `None` for flush sentinels, which callers skip.
    pub fn accept_line(&self, mut raw: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if self.config.naive_flush && raw.trim_ascii_end() == NAIVE_FLUSH_LINE {
            tracing::trace!(engine = %self.name, "Skipping flush line");
            return Ok(None);
        }
        if raw.last() != Some(&b'\n') {
            return Err(EngineError::MalformedLine(
                String::from_utf8_lossy(&raw).into_owned(),
            ));
        }
        raw.pop();
        Ok(Some(raw))
    }

    pub fn trace_incoming(&self, line: &[u8]) {
        if self.config.traces_lines() {
            tracing::trace!(engine = %self.name, line = %preview(line), "TeX -> controller");
        }
    }

    pub fn trace_outgoing(&self, data: &[u8]) {
        if self.config.traces_lines() {
            tracing::trace!(engine = %self.name, data = %preview(data), "controller -> TeX");
        }
    }

    pub fn add_on_close(&mut self, hook: OnClose) {
        self.on_close.push(hook);
    }

    /// Run and forget the close hooks, in registration order.
    pub fn run_on_close(&mut self) {
        for hook in std::mem::take(&mut self.on_close) {
            hook();
        }
    }
}

fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\n');
    match text.char_indices().nth(TRACE_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
