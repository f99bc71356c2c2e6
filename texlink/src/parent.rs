//! Engine for a process that TeX itself started.
//!
//! TeX writes the handshake line first, then protocol lines, on our stdin.
//! Replies travel back through the [`Communicator`] carried in the handshake.

use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use crate::communicate::Communicator;
use crate::config::GlobalConfiguration;
use crate::engine::{Engine, EngineState, OnClose};
use crate::error::{EngineError, Operation, Result};
use crate::handshake::{NAIVE_FLUSH_BLOCK, NAIVE_FLUSH_PAD, decode_handshake};
use crate::name::EngineName;
use crate::status::EngineStatus;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

const COMMUNICATION_LOG_HEADER: &[u8] =
    b"Communication log ['>': TeX to controller, '<': controller to TeX]:\n";

/// What the process knows before the handshake, from its own command line.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub naive_flush: bool,
    /// Written right after the handshake, before the first read.
    pub bootstrap: Option<Vec<u8>>,
    pub handshake_timeout: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            naive_flush: false,
            bootstrap: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_naive_flush(mut self, naive_flush: bool) -> Self {
        self.naive_flush = naive_flush;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<Vec<u8>>) -> Self {
        self.bootstrap = Some(bootstrap.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Diff-style record of every exchanged line, saved on close.
struct CommunicationLog {
    path: PathBuf,
    contents: Vec<u8>,
}

impl CommunicationLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            contents: COMMUNICATION_LOG_HEADER.to_vec(),
        }
    }

    fn incoming(&mut self, raw: &[u8]) {
        self.contents.push(b'>');
        self.contents.extend_from_slice(raw);
    }

    /// Unterminated trailing data is marked with `...`.
    fn outgoing(&mut self, data: &[u8]) {
        let mut lines = data.split(|&b| b == b'\n').peekable();
        while let Some(line) = lines.next() {
            let last = lines.peek().is_none();
            if last && line.is_empty() {
                break;
            }
            self.contents.push(b'<');
            self.contents.extend_from_slice(line);
            if last {
                self.contents.extend_from_slice(b"...");
            }
            self.contents.push(b'\n');
        }
    }

    fn save(&self) -> io::Result<()> {
        std::fs::write(&self.path, &self.contents)
    }
}

pub struct ParentProcessEngine {
    state: EngineState,
    input: Box<dyn BufRead + Send>,
    communicator: Communicator,
    /// Rest of the padded handshake line in naive-flush mode.
    ignore_first_line: bool,
    communication_log: Option<CommunicationLog>,
    closed: bool,
}

impl ParentProcessEngine {
    /// Attach to the TeX process on the other end of stdin.
    pub fn from_stdin(options: AttachOptions) -> Result<Self> {
        Self::attach(BufReader::new(io::stdin()), options)
    }

    /// Read the handshake from `input` and take over the session.
    ///
    /// Fails if nothing arrives within the handshake timeout.
    pub fn attach<R>(input: R, options: AttachOptions) -> Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let naive_flush = options.naive_flush;
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("texlink-handshake".to_string())
            .spawn(move || {
                let mut input = input;
                let line = read_handshake(&mut input, naive_flush);
                let _ = tx.send((input, line));
            })?;

        let (input, line) = match rx.recv_timeout(options.handshake_timeout) {
            Ok((input, line)) => (input, line?),
            Err(RecvTimeoutError::Timeout) => {
                return Err(EngineError::Handshake(format!(
                    "nothing received from TeX within {:?}",
                    options.handshake_timeout
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EngineError::Handshake("handshake reader stopped".to_string()));
            }
        };

        let (name, config) = decode_handshake(&line)?;
        let communicator = config.communicator.clone().ok_or_else(|| {
            EngineError::Handshake("configuration carries no communicator".to_string())
        })?;
        let communication_log = config.communication_log_path().map(|path| {
            tracing::info!(path = %path.display(), "All communications will be logged");
            CommunicationLog::new(path)
        });
        tracing::debug!(engine = %name, debug = config.debug, naive_flush, "Handshake received");

        let mut engine = Self {
            state: EngineState::new(name, config, EngineStatus::Waiting),
            input: Box::new(input),
            communicator,
            ignore_first_line: naive_flush,
            communication_log,
            closed: false,
        };
        if let Some(bootstrap) = &options.bootstrap {
            engine.write(bootstrap)?;
        }
        engine.state.set_status(EngineStatus::Running);
        Ok(engine)
    }

    fn save_communication_log(&self) {
        if let Some(log) = &self.communication_log
            && let Err(e) = log.save()
        {
            tracing::warn!(path = %log.path.display(), error = %e, "Failed to write communication log");
        }
    }
}

/// One handshake line. In naive-flush mode TeX sends it in padded blocks.
fn read_handshake(input: &mut impl BufRead, naive_flush: bool) -> Result<String> {
    let mut content = Vec::new();
    if naive_flush {
        loop {
            let before = content.len();
            input
                .by_ref()
                .take(NAIVE_FLUSH_BLOCK as u64)
                .read_to_end(&mut content)?;
            if content.len() == before {
                break;
            }
            if content.last() == Some(&(NAIVE_FLUSH_PAD as u8)) {
                break;
            }
        }
    } else {
        input.read_until(b'\n', &mut content)?;
    }
    if content.is_empty() {
        return Err(EngineError::Handshake(
            "TeX closed the input before the handshake".to_string(),
        ));
    }
    String::from_utf8(content)
        .map_err(|e| EngineError::Handshake(format!("handshake is not UTF-8: {e}")))
}

impl Engine for ParentProcessEngine {
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
        loop {
            let mut raw = Vec::new();
            let n = match self.input.read_until(b'\n', &mut raw) {
                Ok(n) => n,
                Err(e) => {
                    self.state.set_status(EngineStatus::Error);
                    return Err(e.into());
                }
            };
            if n == 0 {
                tracing::debug!(engine = %self.state.name(), "TeX closed the input");
                self.state.set_status(EngineStatus::Error);
                return Err(EngineError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "TeX closed the input",
                )));
            }
            if std::mem::take(&mut self.ignore_first_line) {
                continue;
            }
            if let Some(log) = &mut self.communication_log {
                log.incoming(&raw);
            }
            if let Some(line) = self.state.accept_line(raw)? {
                self.state.trace_incoming(&line);
                return Ok(line);
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.ensure(Operation::Write)?;
        self.state.trace_outgoing(data);
        if let Err(e) = self.communicator.send(data) {
            self.state.set_status(EngineStatus::Error);
            return Err(e.into());
        }
        if let Some(log) = &mut self.communication_log {
            log.outgoing(data);
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
        if !std::mem::replace(&mut self.closed, true) {
            self.save_communication_log();
            if self.state.status() != EngineStatus::Error {
                self.state.set_status(EngineStatus::Exited);
            }
            self.state.run_on_close();
        }
        Ok(())
    }
}

impl Drop for ParentProcessEngine {
    fn drop(&mut self) {
        if !self.closed {
            self.save_communication_log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicate::{LoopbackNetworkTransport, Transport};
    use crate::handshake::handshake_line;
    use std::io::Cursor;

    fn input(config: &GlobalConfiguration, lines: &[&str]) -> Cursor<Vec<u8>> {
        let mut bytes = handshake_line(EngineName::XeTex, config).unwrap().into_bytes();
        bytes.push(b'\n');
        for line in lines {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        Cursor::new(bytes)
    }

    #[test]
    fn talks_back_through_communicator() {
        let (communicator, forwarder) = LoopbackNetworkTransport.setup().unwrap();
        let relay = std::thread::spawn(move || {
            let mut out = Vec::new();
            forwarder.run(&mut out).map(|_| out)
        });

        let config = GlobalConfiguration::new().with_communicator(communicator);
        let mut engine = ParentProcessEngine::attach(
            input(&config, &["first", "second"]),
            AttachOptions::new().with_bootstrap(b"bootstrap\n".to_vec()),
        )
        .unwrap();
        drop(config);

        assert_eq!(engine.name(), EngineName::XeTex);
        assert!(engine.is_unicode());
        assert_eq!(engine.status(), EngineStatus::Running);
        assert_eq!(engine.read().unwrap(), b"first");
        engine.mark_waiting().unwrap();
        engine.write(b"reply\n").unwrap();
        assert_eq!(engine.read().unwrap(), b"second");
        engine.close().unwrap();
        assert_eq!(engine.status(), EngineStatus::Exited);
        drop(engine);

        assert_eq!(relay.join().unwrap().unwrap(), b"bootstrap\nreply\n");
    }

    #[test]
    fn end_of_input_is_an_error() {
        let config = GlobalConfiguration::new().with_communicator(Communicator::new(
            crate::communicate::CommunicatorAddress::LoopbackNetwork { port: 9 },
        ));
        let mut engine = ParentProcessEngine::attach(input(&config, &[]), AttachOptions::new()).unwrap();
        assert!(matches!(engine.read(), Err(EngineError::Transport(_))));
        assert_eq!(engine.status(), EngineStatus::Error);
        assert!(matches!(engine.read(), Err(EngineError::AlreadyFailed)));
    }

    #[test]
    fn naive_flush_handshake_skips_padding_line() {
        let config = GlobalConfiguration::new()
            .with_naive_flush(true)
            .with_debug(3)
            .with_communicator(Communicator::new(
                crate::communicate::CommunicatorAddress::UnnamedPipe { pid: 1, fd: 3 },
            ));
        let stream = input(&config, &["pythonimmediate-naive-flush-line", "payload"]);
        let mut engine =
            ParentProcessEngine::attach(stream, AttachOptions::new().with_naive_flush(true)).unwrap();
        assert_eq!(engine.config().debug, 3);
        assert_eq!(engine.read().unwrap(), b"payload");
    }

    #[test]
    fn missing_communicator_is_rejected() {
        let err = ParentProcessEngine::attach(
            input(&GlobalConfiguration::new(), &[]),
            AttachOptions::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Handshake(_)));
    }

    #[test]
    fn silent_tex_times_out() {
        struct Stalled;
        impl Read for Stalled {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                loop {
                    std::thread::park();
                }
            }
        }
        let err = ParentProcessEngine::attach(
            BufReader::new(Stalled),
            AttachOptions::new().with_handshake_timeout(Duration::from_millis(50)),
        )
        .err()
        .unwrap();
        insta::assert_snapshot!(err.to_string(), @"handshake failed: nothing received from TeX within 50ms");
    }

    #[test]
    fn communication_log_is_saved_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("comm-$pid.log");
        let (communicator, forwarder) = LoopbackNetworkTransport.setup().unwrap();
        let relay = std::thread::spawn(move || forwarder.run(&mut io::sink()));

        let config = GlobalConfiguration::new()
            .with_communication_log(template.to_string_lossy())
            .with_communicator(communicator);
        let mut engine =
            ParentProcessEngine::attach(input(&config, &["hello"]), AttachOptions::new()).unwrap();
        assert_eq!(engine.read().unwrap(), b"hello");
        engine.mark_waiting().unwrap();
        engine.write(b"one\ntwo").unwrap();
        engine.close().unwrap();
        drop(engine);
        relay.join().unwrap().unwrap();

        let path = dir.path().join(format!("comm-{}.log", std::process::id()));
        let log = std::fs::read_to_string(path).unwrap();
        insta::assert_snapshot!(log, @r"
        Communication log ['>': TeX to controller, '<': controller to TeX]:
        >hello
        <one
        <two...
        ");
    }
}
