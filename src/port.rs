//! Free TCP port discovery for the control-plane process.
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use tracing::debug;

use crate::{constants::PORT_PROBE_TIMEOUT, error::PortError};

/// Returns `true` when nothing listens on `port` and it can be bound locally.
///
/// Both probes are needed: some services accept connections without a
/// conventional listen backlog, and some ports are reserved by the OS with no
/// listener at all.
pub fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    if TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok() {
        debug!("port {port} has a listener");
        return false;
    }

    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) => {
            debug!("port {port} cannot be bound: {err}");
            false
        }
    }
}

/// Scans ports sequentially from `starting_at` and returns the first free one.
///
/// Fails with [`PortError::Exhausted`] after `max_attempts` consecutive busy
/// ports, or when the scan would run past `u16::MAX`.
pub fn find_available_port(starting_at: u16, max_attempts: u32) -> Result<u16, PortError> {
    let mut candidate = Some(starting_at);

    for _ in 0..max_attempts {
        let Some(port) = candidate else {
            break;
        };
        if is_port_available(port) {
            debug!("selected port {port}");
            return Ok(port);
        }
        candidate = port.checked_add(1);
    }

    Err(PortError::Exhausted {
        start: starting_at,
        attempts: max_attempts,
    })
}
