//! Process and protocol layer for driving TeX engines.
//!
//! A TeX run using the `pythonimmediate` package pauses to ask its controller
//! for work and resumes on the reply. This crate owns that conversation:
//!
//! - [`ChildProcessEngine`]: start TeX as a subprocess, detect its errors from
//!   console output, optionally restart it.
//! - [`ParentProcessEngine`]: this process was started by TeX; reply through
//!   the reverse channel described in the handshake.
//! - [`MultiChildProcessEngine`]: identical replicas kept in lockstep by
//!   replaying an action log, so one can be taken out and finished.
//! - [`DefaultEngine`]: the current thread's engine, swapped with [`set_engine`].
//!
//! Every engine follows the same turn-taking state machine ([`EngineStatus`]).

pub mod child;
pub mod communicate;
pub mod config;
pub mod default_engine;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod multi;
pub mod name;
pub mod parent;
pub mod status;

#[cfg(test)]
mod testing;

pub use child::{ChildProcessConfig, ChildProcessEngine, LatexSpawner, ProcessSpawner, SpawnRequest};
pub use communicate::{
    Communicator, CommunicatorAddress, Forwarder, Transport, TransportMode, select_transport,
};
pub use config::GlobalConfiguration;
pub use default_engine::{DefaultEngine, EngineScope, get_engine, set_engine, with_engine};
pub use engine::{Engine, NAIVE_FLUSH_LINE, OnClose, SharedEngine, shared};
pub use error::{EngineError, Operation, Result};
pub use handshake::{decode_handshake, encode_config, handshake_line};
pub use multi::{EngineAction, ExtractedReplica, MultiChildProcessEngine, TransientScope};
pub use name::EngineName;
pub use parent::{AttachOptions, ParentProcessEngine};
pub use status::EngineStatus;
