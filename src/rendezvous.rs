//! One-shot listener for the "backend launched in a terminal" flow.
//!
//! When the backend is started by a third party (the editor's terminal),
//! this process cannot spawn and pipe it directly; instead the backend is
//! told to dial back to a pre-chosen port via a `--client-addr` flag and we
//! accept exactly one inbound connection here.

use crate::error::ProxyError;
use log::debug;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Single-accept TCP server. At most one active listener exists per proxy
/// instance, and it is torn down right after the first accept or timeout.
pub struct Rendezvous {
    listener: TcpListener,
}

impl Rendezvous {
    /// Bind the pre-chosen port. Binding happens before the backend command
    /// line is handed to the terminal, so the dial-back cannot be lost.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Wait for the single inbound connection. Consumes the listener: once
    /// a connection is accepted (or the timeout expires) no further
    /// connections are possible.
    pub fn accept(self, timeout: Duration) -> Result<TcpStream, ProxyError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: "proxy", "backend dialed back from {peer}");
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(ProxyError::RendezvousTimeout);
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
