//! Identical interpreter replicas kept in lockstep.
//!
//! Every write is broadcast to all replicas and every read is answered by
//! replica 0 and checked against the others. Both are recorded in an action
//! log, so a new replica can be brought to the same state by replaying it.
//! [`MultiChildProcessEngine::extract_one`] peels a replica off the pool, for
//! instance to end its document and inspect the output, while the rest carry on.
//!
//! Replay assumes the interpreter is deterministic. Nothing enforces it; a
//! replica that answers differently is reported as [`EngineError::Divergence`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::child::{ChildProcessConfig, ChildProcessEngine};
use crate::config::GlobalConfiguration;
use crate::default_engine::{EngineScope, set_engine};
use crate::engine::{Engine, EngineState, OnClose, SharedEngine, lock_engine};
use crate::error::{EngineError, Operation, Result};
use crate::name::EngineName;
use crate::status::EngineStatus;

/// One entry of the action log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Line every replica must produce, without newline.
    Read(Vec<u8>),
    /// Bytes written to every replica.
    Write(Vec<u8>),
}

impl EngineAction {
    fn apply(&self, index: usize, replica: &mut ChildProcessEngine) -> Result<()> {
        match self {
            Self::Write(data) => replica.send(data),
            Self::Read(expected) => match replica.read_line() {
                Ok(actual) if actual == *expected => Ok(()),
                Ok(actual) => Err(EngineError::Divergence {
                    replica: index,
                    expected: String::from_utf8_lossy(expected).into_owned(),
                    actual: String::from_utf8_lossy(&actual).into_owned(),
                }),
                Err(e) => Err(EngineError::Divergence {
                    replica: index,
                    expected: String::from_utf8_lossy(expected).into_owned(),
                    actual: format!("<{e}>"),
                }),
            },
        }
    }
}

/// Reentrant transient-context counter.
#[derive(Debug, Default, Clone)]
struct TransientDepth(Arc<AtomicUsize>);

impl TransientDepth {
    fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn exit(&self) -> Option<usize> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

/// Leaves the transient context when dropped.
#[must_use = "the transient context ends as soon as the scope is dropped"]
pub struct TransientScope {
    depth: TransientDepth,
}

impl Drop for TransientScope {
    fn drop(&mut self) {
        self.depth.exit();
    }
}

/// Replica taken out of a [`MultiChildProcessEngine`].
///
/// While it lives the replica is this thread's default engine. Dropping it
/// restores the previous default engine and closes the replica.
pub struct ExtractedReplica {
    replica: Arc<Mutex<ChildProcessEngine>>,
    scope: Option<EngineScope>,
}

impl ExtractedReplica {
    pub fn engine(&self) -> &Arc<Mutex<ChildProcessEngine>> {
        &self.replica
    }

    pub fn lock(&self) -> MutexGuard<'_, ChildProcessEngine> {
        lock_engine(&self.replica)
    }
}

impl Drop for ExtractedReplica {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.restore();
        }
        let mut replica = lock_engine(&self.replica);
        if let Err(e) = replica.close() {
            tracing::warn!(error = %e, "Failed to close extracted replica");
        }
    }
}

pub struct MultiChildProcessEngine {
    state: EngineState,
    config: ChildProcessConfig,
    replicas: Vec<ChildProcessEngine>,
    action_log: Vec<EngineAction>,
    transient: TransientDepth,
}

impl MultiChildProcessEngine {
    /// Start `count` replicas, all created from `config`.
    pub fn start(count: usize, config: ChildProcessConfig) -> Result<Self> {
        if count == 0 {
            return Err(EngineError::Config(
                "at least one replica is required".to_string(),
            ));
        }
        let mut engine = Self {
            state: EngineState::new(config.name, config.global.clone(), EngineStatus::Waiting),
            config,
            replicas: Vec::with_capacity(count),
            action_log: Vec::new(),
            transient: TransientDepth::default(),
        };
        for _ in 0..count {
            engine.start_child_process()?;
        }
        tracing::info!(engine = %engine.state.name(), replicas = count, "Replica pool started");
        Ok(engine)
    }

    /// Spawn one more replica, replay the action log into it and admit it.
    pub fn start_child_process(&mut self) -> Result<()> {
        let index = self.replicas.len();
        let mut replica = ChildProcessEngine::start(self.config.clone())?;
        for action in &self.action_log {
            if let Err(e) = action.apply(index, &mut replica) {
                return Err(self.fail(e));
            }
        }
        tracing::debug!(replica = index, replayed = self.action_log.len(), "Replica admitted");
        self.replicas.push(replica);
        Ok(())
    }

    /// Remove the most recently added replica and make it this thread's
    /// default engine until the returned guard is dropped.
    ///
    /// With `do_replace`, a log-replayed replacement joins the pool first.
    pub fn extract_one(&mut self, do_replace: bool) -> Result<ExtractedReplica> {
        let replica = self
            .replicas
            .pop()
            .ok_or_else(|| EngineError::Config("no replica left to extract".to_string()))?;
        let index = self.replicas.len();
        if do_replace && let Err(e) = self.start_child_process() {
            self.replicas.push(replica);
            return Err(e);
        }
        replica.adopt_status(self.state.status());
        tracing::debug!(replica = index, replaced = do_replace, "Replica extracted");

        let replica = Arc::new(Mutex::new(replica));
        let shared: SharedEngine = replica.clone();
        Ok(ExtractedReplica {
            replica,
            scope: Some(set_engine(Some(shared))),
        })
    }

    /// Enter a transient context. Operations in it reach only replica 0 and
    /// are not logged; the caller asserts they do not change the
    /// interpreter's state.
    pub fn enter_transient(&self) -> usize {
        self.transient.enter()
    }

    pub fn exit_transient(&self) -> Result<usize> {
        self.transient
            .exit()
            .ok_or_else(|| EngineError::Config("not in a transient context".to_string()))
    }

    /// Transient context lasting as long as the returned scope.
    pub fn transient(&self) -> TransientScope {
        self.transient.enter();
        TransientScope {
            depth: self.transient.clone(),
        }
    }

    pub fn transient_depth(&self) -> usize {
        self.transient.get()
    }

    fn in_transient(&self) -> bool {
        self.transient.get() > 0
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replicas(&self) -> &[ChildProcessEngine] {
        &self.replicas
    }

    pub fn action_log(&self) -> &[EngineAction] {
        &self.action_log
    }

    fn primary(&mut self) -> Result<&mut ChildProcessEngine> {
        self.replicas
            .first_mut()
            .ok_or_else(|| EngineError::Config("no replicas left".to_string()))
    }

    /// Record a failure in the pool's own status and hand the error back.
    fn fail(&self, error: EngineError) -> EngineError {
        match &error {
            EngineError::Exited => self.state.set_status(EngineStatus::Exited),
            EngineError::Divergence { replica, .. } => {
                tracing::error!(replica, error = %error, "Replicas diverged");
                self.state.set_status(EngineStatus::Error);
            }
            _ => self.state.set_status(EngineStatus::Error),
        }
        error
    }

    /// Apply `action` to every replica but the first.
    fn check_secondaries(&mut self, action: &EngineAction) -> Result<()> {
        let mut outcome = Ok(());
        for (index, replica) in self.replicas.iter_mut().enumerate().skip(1) {
            if let Err(e) = action.apply(index, replica) {
                outcome = Err(e);
                break;
            }
        }
        outcome.map_err(|e| self.fail(e))
    }
}

impl Engine for MultiChildProcessEngine {
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
        self.state.ensure(Operation::Read)?;
        let line = match self.primary().and_then(ChildProcessEngine::read_line) {
            Ok(line) => line,
            Err(e) => return Err(self.fail(e)),
        };
        if self.in_transient() {
            return Ok(line);
        }

        let action = EngineAction::Read(line.clone());
        self.check_secondaries(&action)?;
        self.action_log.push(action);
        Ok(line)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.ensure(Operation::Write)?;
        if let Err(e) = self.primary().and_then(|primary| primary.send(data)) {
            return Err(self.fail(e));
        }
        if !self.in_transient() {
            let action = EngineAction::Write(data.to_vec());
            self.check_secondaries(&action)?;
            self.action_log.push(action);
        }
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
        let mut first_error = None;
        let status = self.state.status();
        for mut replica in self.replicas.drain(..) {
            replica.adopt_status(status);
            if let Err(e) = replica.close() {
                first_error.get_or_insert(e);
            }
        }
        if self.state.status() != EngineStatus::Error {
            self.state.set_status(EngineStatus::Exited);
        }
        self.state.run_on_close();
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for MultiChildProcessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiChildProcessEngine")
            .field("name", &self.state.name())
            .field("status", &self.state.status())
            .field("replicas", &self.replicas.len())
            .field("logged_actions", &self.action_log.len())
            .field("transient_depth", &self.transient.get())
            .finish()
    }
}

impl Drop for MultiChildProcessEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close replica pool");
        }
    }
}
