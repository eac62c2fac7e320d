//! Local port selection and bounded connect retries.

use crate::error::ProxyError;
use log::debug;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Ask the OS for a free local TCP port by binding to port 0, reading the
/// assigned port and closing the listener.
///
/// Another process can claim the port between close and reuse; the race is
/// accepted rather than retry-proofed, the bounded connect retries absorb
/// the common case.
pub fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Connect to `addr` with a per-attempt timeout and a small bounded retry
/// loop with fixed backoff.
///
/// This absorbs the window between "backend printed its ready marker" and
/// "the listener actually accepts".
pub fn connect_retry(
    addr: &str,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let targets: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|err| ProxyError::Connect {
            addr: addr.to_string(),
            reason: err.to_string(),
        })?
        .collect();

    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            std::thread::sleep(backoff);
        }
        for target in &targets {
            match TcpStream::connect_timeout(target, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(target: "proxy", "connected to backend at {target} (attempt {})", attempt + 1);
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
    }

    Err(ProxyError::Connect {
        addr: addr.to_string(),
        reason: last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no resolvable address".to_string()),
    })
}
