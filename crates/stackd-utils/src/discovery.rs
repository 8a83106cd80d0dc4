use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("failed to bind a scratch listener on the loopback interface: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to read the scratch listener's address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Asks the OS for a free loopback port.
///
/// Binds `127.0.0.1:0`, reads back the assigned address and closes the
/// listener before returning. Another process may claim the port before the caller
/// binds it again.
///
/// # Errors
///
/// Returns an error if the scratch listener cannot be bound.
pub fn next_available_addr() -> Result<SocketAddr, PortError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(PortError::Bind)?;
    let addr = listener.local_addr().map_err(PortError::LocalAddr)?;
    drop(listener);

    debug!("Allocated loopback address {}", addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn allocated_port_is_loopback_and_reusable() {
        let addr = next_available_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        // The scratch listener is closed, so the port can be bound again.
        TcpListener::bind(addr).unwrap();
    }
}
