//! Loopback TCP transport. Works anywhere the sibling can reach localhost.

use std::io::{self, Read};
use std::net::{Ipv4Addr, TcpListener};

use super::{Communicator, CommunicatorAddress, Forwarder, Transport, TransportMode};

const MAX_BIND_ATTEMPTS: usize = 64;
const RELAY_CHUNK_BYTES: usize = 8192;

pub struct LoopbackNetworkTransport;

impl Transport for LoopbackNetworkTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::LoopbackNetwork
    }

    fn is_available(&self) -> bool {
        true
    }

    fn setup(&self) -> io::Result<(Communicator, Forwarder)> {
        let (listener, port) = bind_random_port()?;
        tracing::debug!(port, "Forwarder listening");

        let forwarder = Forwarder::new(TransportMode::LoopbackNetwork, move |dest| {
            let (mut stream, peer) = listener.accept()?;
            tracing::trace!(%peer, "Sender connected");
            drop(listener);

            let mut buf = [0u8; RELAY_CHUNK_BYTES];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        dest.write_all(&buf[..n])?;
                        dest.flush()?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        });

        let address = CommunicatorAddress::LoopbackNetwork { port };
        Ok((Communicator::new(address), forwarder))
    }
}

/// Bind localhost on a random unprivileged port, retrying on collisions.
fn bind_random_port() -> io::Result<(TcpListener, u16)> {
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = fastrand::u16(1024..=u16::MAX);
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::trace!(port, "Port in use, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free localhost port after {MAX_BIND_ATTEMPTS} attempts"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_unprivileged_port() {
        let (listener, port) = bind_random_port().unwrap();
        assert!(port >= 1024);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn relays_chunks_until_disconnect() {
        let (communicator, forwarder) = LoopbackNetworkTransport.setup().unwrap();
        assert!(matches!(
            communicator.address(),
            CommunicatorAddress::LoopbackNetwork { .. }
        ));

        let relay = std::thread::spawn(move || {
            let mut out = Vec::new();
            forwarder.run(&mut out).map(|_| out)
        });

        communicator.send(b"partial ").unwrap();
        communicator.send(b"line\nand more\n").unwrap();
        drop(communicator);

        let out = relay.join().unwrap().unwrap();
        assert_eq!(out, b"partial line\nand more\n");
    }
}
