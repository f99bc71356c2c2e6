//! Unnamed pipe reached through the process filesystem.
//!
//! The forwarder allocates a pipe and publishes `(pid, write fd)`. The sibling
//! opens `/proc/<pid>/fd/<fd>`, which only works while both processes share a
//! `/proc` view (Linux, same PID namespace).

use std::io;
use std::path::Path;

use super::{Communicator, Forwarder, Transport, TransportMode};

const PROC_SELF_FD: &str = "/proc/self/fd";

/// The sibling can reach our descriptors only if `fd_dir` lists them.
pub(crate) fn available_at(fd_dir: &Path) -> bool {
    cfg!(unix) && fd_dir.is_dir()
}

pub struct UnnamedPipeTransport;

impl Transport for UnnamedPipeTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::UnnamedPipe
    }

    fn is_available(&self) -> bool {
        available_at(Path::new(PROC_SELF_FD))
    }

    #[cfg(unix)]
    fn setup(&self) -> io::Result<(Communicator, Forwarder)> {
        use std::fs::File;
        use std::io::{BufRead, BufReader};
        use std::os::fd::AsRawFd;

        use super::CommunicatorAddress;

        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;

        let address = CommunicatorAddress::UnnamedPipe {
            pid: std::process::id(),
            fd: write_end.as_raw_fd(),
        };
        tracing::debug!(?address, "Created forwarder pipe");

        let forwarder = Forwarder::new(TransportMode::UnnamedPipe, move |dest| {
            // Our copy of the write end keeps the pipe open; it is released
            // once the sibling has opened its own, so its exit means EOF here.
            // If the sibling never writes this blocks forever.
            let mut write_end = Some(write_end);
            let mut reader = BufReader::new(File::from(read_end));
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                if write_end.take().is_some() {
                    tracing::trace!("Released forwarder write end");
                }
                dest.write_all(&line)?;
                dest.flush()?;
            }
            Ok(())
        });

        Ok((Communicator::new(address), forwarder))
    }

    #[cfg(not(unix))]
    fn setup(&self) -> io::Result<(Communicator, Forwarder)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unnamed pipe transport requires /proc",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn available_only_with_descriptor_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_at(dir.path()));
        assert!(!available_at(&dir.path().join("missing")));

        let file = dir.path().join("fd");
        std::fs::write(&file, b"").unwrap();
        assert!(!available_at(&file));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn available_on_linux() {
        assert!(UnnamedPipeTransport.is_available());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn relays_lines_until_sender_closes() {
        let (communicator, forwarder) = UnnamedPipeTransport.setup().unwrap();
        let relay = std::thread::spawn(move || {
            let mut out = Vec::new();
            forwarder.run(&mut out).map(|_| out)
        });

        communicator.send(b"first line\n").unwrap();
        communicator.send(b"second\n").unwrap();
        drop(communicator);

        let out = relay.join().unwrap().unwrap();
        assert_eq!(out, b"first line\nsecond\n");
    }
}
