//! The inbound TCP listener, accepting connections from peers that found us
//! through the tracker or another peer's `have` gossip.

use std::ops::RangeInclusive;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};

/// Binds to the first available port in the given range, scanning upward.
pub(crate) struct Listener {
    listener: TcpListener,
    port: u16,
}

impl Listener {
    pub async fn bind(port_range: RangeInclusive<u16>) -> Result<Self> {
        for port in port_range.clone() {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok(Self { listener, port }),
                Err(_) => continue,
            }
        }
        Err(Error::Config(format!(
            "could not bind to any port in {}..={}",
            port_range.start(),
            port_range.end()
        )))
    }

    /// The port this listener ended up bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accepts the next inbound connection.
    pub async fn accept(&mut self) -> Result<(TcpStream, std::net::SocketAddr)> {
        let (socket, addr) = self.listener.accept().await?;
        Ok((socket, addr))
    }
}
