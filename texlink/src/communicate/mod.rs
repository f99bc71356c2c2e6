//! Reverse channel from a process spawned by the interpreter back to it.
//!
//! The interpreter can only read its own stdin-like streams, so a helper
//! (`texlink-forward`) owns the channel: it sets up a [`Transport`], prints the
//! resulting [`Communicator`] inside the handshake configuration, then runs
//! the [`Forwarder`] which relays everything received onto the interpreter.
//! The sibling process decodes the configuration and calls
//! [`Communicator::send`].
//!
//! Transports, in order of preference:
//! - **unnamed-pipe**: OS pipe reached through `/proc/<pid>/fd/<fd>` (Linux)
//! - **loopback-network**: TCP on a random localhost port (everywhere)

mod network;
mod pipe;

use std::fmt;
use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub use network::LoopbackNetworkTransport;
pub use pipe::UnnamedPipeTransport;

/// Where the sending side connects to. Serialized into the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum CommunicatorAddress {
    UnnamedPipe { pid: u32, fd: i32 },
    LoopbackNetwork { port: u16 },
}

impl CommunicatorAddress {
    pub fn mode(&self) -> TransportMode {
        match self {
            Self::UnnamedPipe { .. } => TransportMode::UnnamedPipe,
            Self::LoopbackNetwork { .. } => TransportMode::LoopbackNetwork,
        }
    }

    fn connect(&self) -> io::Result<Box<dyn Write + Send>> {
        match self {
            Self::UnnamedPipe { pid, fd } => {
                let path = format!("/proc/{pid}/fd/{fd}");
                tracing::debug!(%path, "Opening forwarder pipe");
                let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                Ok(Box::new(file))
            }
            Self::LoopbackNetwork { port } => {
                tracing::debug!(port, "Connecting to forwarder");
                let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, *port))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Sending half of the reverse channel.
///
/// Clones share one lazily opened connection; the connection itself is never
/// serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct Communicator {
    address: CommunicatorAddress,
    #[serde(skip)]
    connection: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl Communicator {
    pub fn new(address: CommunicatorAddress) -> Self {
        Self {
            address,
            connection: Arc::default(),
        }
    }

    pub fn address(&self) -> &CommunicatorAddress {
        &self.address
    }

    /// Send bytes to the forwarder, connecting on first use.
    ///
    /// A failed write drops the connection; the next call reconnects.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut slot = self.connection.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Communicator connection mutex poisoned");
            poisoned.into_inner()
        });
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.address.connect()?,
        };
        conn.write_all(data)?;
        conn.flush()?;
        *slot = Some(conn);
        Ok(())
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Communicator {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

/// Blocking relay loop run by the process that owns the receiving end.
pub struct Forwarder {
    mode: TransportMode,
    relay: Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>,
}

impl Forwarder {
    pub(crate) fn new(
        mode: TransportMode,
        relay: impl FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            mode,
            relay: Box::new(relay),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Relay everything received to `dest` until the sender disconnects.
    pub fn run(self, dest: &mut dyn Write) -> io::Result<()> {
        tracing::debug!(mode = %self.mode, "Forwarder running");
        let result = (self.relay)(dest);
        tracing::debug!(mode = %self.mode, ok = result.is_ok(), "Forwarder finished");
        result
    }
}

/// Byte-transport strategy for the reverse channel.
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Whether this transport works on the current platform.
    fn is_available(&self) -> bool;

    /// Allocate the receiving end. Returns the sending half and the relay loop.
    fn setup(&self) -> io::Result<(Communicator, Forwarder)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    UnnamedPipe,
    LoopbackNetwork,
}

impl TransportMode {
    /// Preference order used when no mode is requested. The pipe is faster.
    pub const PREFERENCE: [TransportMode; 2] = [Self::UnnamedPipe, Self::LoopbackNetwork];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnnamedPipe => "unnamed-pipe",
            Self::LoopbackNetwork => "loopback-network",
        }
    }

    pub fn transport(&self) -> &'static dyn Transport {
        match self {
            Self::UnnamedPipe => &UnnamedPipeTransport,
            Self::LoopbackNetwork => &LoopbackNetworkTransport,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unknown transport mode '{s}'")))
    }
}

/// Pick a transport: the requested one if available, else the first available
/// in [`TransportMode::PREFERENCE`].
pub fn select_transport(requested: Option<TransportMode>) -> Result<&'static dyn Transport> {
    if let Some(mode) = requested {
        let transport = mode.transport();
        if !transport.is_available() {
            return Err(EngineError::Config(format!(
                "transport '{mode}' is not available on this platform"
            )));
        }
        return Ok(transport);
    }

    TransportMode::PREFERENCE
        .into_iter()
        .map(|mode| mode.transport())
        .find(|transport| transport.is_available())
        .ok_or_else(|| EngineError::Config("no transport available".to_string()))
}
