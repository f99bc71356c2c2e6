//! Per-thread default engine.
//!
//! Code that talks to TeX usually does not carry an engine around; it uses
//! [`DefaultEngine`], which forwards to whatever engine the current thread has
//! installed with [`set_engine`]. Threads start with none, including threads
//! spawned from one that has an engine.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::GlobalConfiguration;
use crate::engine::{Engine, OnClose, SharedEngine, lock_engine};
use crate::error::{EngineError, Result};
use crate::name::EngineName;
use crate::status::EngineStatus;

thread_local! {
    static CURRENT: RefCell<Option<SharedEngine>> = const { RefCell::new(None) };
}

fn replace_current(engine: Option<SharedEngine>) -> Option<SharedEngine> {
    CURRENT.with(|slot| slot.replace(engine))
}

/// Restores the previously installed engine when dropped.
///
/// Tied to the thread that created it.
#[must_use = "the previous engine is restored as soon as the scope is dropped"]
pub struct EngineScope {
    previous: Option<Option<SharedEngine>>,
    _thread_bound: PhantomData<*const ()>,
}

impl EngineScope {
    /// Restore the previous engine now.
    pub fn restore(mut self) {
        self.restore_previous();
    }

    /// Keep the new engine installed after the scope ends.
    pub fn persist(mut self) {
        self.previous = None;
    }

    fn restore_previous(&mut self) {
        if let Some(previous) = self.previous.take() {
            replace_current(previous);
        }
    }
}

impl Drop for EngineScope {
    fn drop(&mut self) {
        self.restore_previous();
    }
}

/// Install `engine` (or none) as this thread's default engine.
pub fn set_engine(engine: Option<SharedEngine>) -> EngineScope {
    EngineScope {
        previous: Some(replace_current(engine)),
        _thread_bound: PhantomData,
    }
}

/// Run `f` with `engine` installed, restoring the previous one afterwards,
/// also when `f` panics.
pub fn with_engine<T>(engine: SharedEngine, f: impl FnOnce() -> T) -> T {
    let _scope = set_engine(Some(engine));
    f()
}

/// This thread's default engine.
pub fn get_engine() -> Result<SharedEngine> {
    current().ok_or(EngineError::NoDefaultEngine)
}

pub fn current() -> Option<SharedEngine> {
    CURRENT.with(|slot| slot.borrow().clone())
}

pub fn is_set() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}

/// Engine that forwards every call to the thread's default engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEngine;

impl DefaultEngine {
    fn with<T>(&self, f: impl FnOnce(&mut dyn Engine) -> Result<T>) -> Result<T> {
        let engine = get_engine()?;
        let mut guard = lock_engine(&engine);
        f(&mut *guard)
    }

    /// Like [`Engine::name`], but reports a missing engine instead of panicking.
    pub fn try_name(&self) -> Result<EngineName> {
        self.with(|engine| Ok(engine.name()))
    }

    pub fn try_config(&self) -> Result<GlobalConfiguration> {
        self.with(|engine| Ok(engine.config()))
    }

    pub fn try_status(&self) -> Result<EngineStatus> {
        self.with(|engine| Ok(engine.status()))
    }

    /// Whether this is the same engine as `engine`.
    pub fn is(&self, engine: &SharedEngine) -> bool {
        current().is_some_and(|current| Arc::ptr_eq(&current, engine))
    }
}

/// The infallible accessors have nothing to return without an engine and
/// panic; use the `try_` variants when an engine may be missing.
impl Engine for DefaultEngine {
    fn name(&self) -> EngineName {
        match self.try_name() {
            Ok(name) => name,
            Err(e) => panic!("{e}"),
        }
    }

    fn config(&self) -> GlobalConfiguration {
        match self.try_config() {
            Ok(config) => config,
            Err(e) => panic!("{e}"),
        }
    }

    fn status(&self) -> EngineStatus {
        match self.try_status() {
            Ok(status) => status,
            Err(e) => panic!("{e}"),
        }
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        self.with(|engine| engine.read())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.with(|engine| engine.write(data))
    }

    fn mark_waiting(&mut self) -> Result<()> {
        self.with(|engine| engine.mark_waiting())
    }

    fn add_on_close(&mut self, hook: OnClose) -> Result<()> {
        self.with(|engine| engine.add_on_close(hook))
    }

    fn close(&mut self) -> Result<()> {
        self.with(|engine| engine.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::error::Operation;
    use std::sync::Mutex;

    /// In-memory engine answering every write with the same bytes.
    struct Echo {
        state: EngineState,
        pending: Vec<Vec<u8>>,
    }

    impl Echo {
        fn shared(name: EngineName) -> SharedEngine {
            Arc::new(Mutex::new(Echo {
                state: EngineState::new(name, GlobalConfiguration::default(), EngineStatus::Waiting),
                pending: Vec::new(),
            }))
        }
    }

    impl Engine for Echo {
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
            Ok(self.pending.remove(0))
        }
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.state.ensure(Operation::Write)?;
            self.pending.push(data.trim_ascii_end().to_vec());
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
            self.state.run_on_close();
            Ok(())
        }
    }

    #[test]
    fn accessors_without_engine_fail() {
        assert!(!is_set());
        assert!(matches!(get_engine(), Err(EngineError::NoDefaultEngine)));
        assert!(matches!(DefaultEngine.read(), Err(EngineError::NoDefaultEngine)));
        assert!(matches!(DefaultEngine.try_status(), Err(EngineError::NoDefaultEngine)));
    }

    #[test]
    fn scope_restores_previous_engine() {
        let outer = Echo::shared(EngineName::PdfTex);
        let inner = Echo::shared(EngineName::LuaTex);

        let outer_scope = set_engine(Some(Arc::clone(&outer)));
        {
            let _inner_scope = set_engine(Some(Arc::clone(&inner)));
            assert_eq!(DefaultEngine.try_name().unwrap(), EngineName::LuaTex);
            assert!(DefaultEngine.is(&inner));
        }
        assert!(DefaultEngine.is(&outer));

        let none_scope = set_engine(None);
        assert!(!is_set());
        none_scope.restore();
        assert!(DefaultEngine.is(&outer));

        outer_scope.restore();
        assert!(!is_set());
    }

    #[test]
    fn persist_keeps_engine_installed() {
        let engine = Echo::shared(EngineName::XeTex);
        set_engine(Some(Arc::clone(&engine))).persist();
        assert!(DefaultEngine.is(&engine));
        set_engine(None).persist();
        assert!(!is_set());
    }

    #[test]
    fn restored_after_panic() {
        let engine = Echo::shared(EngineName::PdfTex);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: () = with_engine(Arc::clone(&engine), || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!is_set());
    }

    #[test]
    fn delegates_reads_and_writes() {
        let engine = Echo::shared(EngineName::PdfTex);
        with_engine(engine, || {
            let mut e = DefaultEngine;
            e.write(b"hello\n").unwrap();
            assert_eq!(e.status(), EngineStatus::Running);
            assert!(matches!(
                e.write(b"again\n"),
                Err(EngineError::ProtocolViolation { .. })
            ));
            assert_eq!(e.read().unwrap(), b"hello");
            e.mark_waiting().unwrap();
            assert!(!e.is_unicode());
        });
    }

    #[test]
    fn spawned_threads_see_no_engine() {
        let engine = Echo::shared(EngineName::PdfTex);
        with_engine(engine, || {
            assert!(is_set());
            let seen = std::thread::spawn(is_set).join().unwrap();
            assert!(!seen);
        });
    }
}
