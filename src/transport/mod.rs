pub mod network_simulator;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::peer::peer_events::StatusCode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// the transport is not connected, nothing was sent
    Skipped,
    Failed,
}

/// A connection to a single server, either datagram or stream based. Received data is passed to
///  a [PacketHandler] from a background task owned by the transport.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport : Sync + Send {
    /// `address` is `host:port`, IPv6 literals must be enclosed in brackets
    async fn connect(&self, address: &str, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()>;

    async fn send(&self, buf: &[u8]) -> SendOutcome;

    /// Closes the connection and stops the receive loop. Calling this on a transport that is not
    ///  connected has no effect.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// `true` for datagram transports, which may lose packets
    fn is_datagram(&self) -> bool;
}

/// Decouples the transport from the handling of the data it receives. This is called from the
///  transport's receive loop and must not block.
#[cfg_attr(test, automock)]
pub trait PacketHandler : Sync + Send {
    fn on_packet(&self, buf: &[u8]);

    /// reports a failure of the receive loop, after which the loop terminates
    fn on_transport_error(&self, status: StatusCode);
}

/// Splits an address into host and port. IPv6 literals must be enclosed in brackets, e.g.
///  `[::1]:5055`.
pub fn split_host_port(address: &str) -> anyhow::Result<(&str, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal: {}", address))?;
        let port = rest.strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port: {}", address))?;
        (host, port)
    }
    else {
        let (host, port) = address.rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port: {}", address))?;
        if host.contains(':') {
            bail!("IPv6 addresses must be enclosed in brackets: {}", address);
        }
        (host, port)
    };

    if host.is_empty() {
        bail!("missing host: {}", address);
    }
    let port = port.parse::<u16>()
        .map_err(|_| anyhow!("invalid port: {}", address))?;
    Ok((host, port))
}

/// Resolves `host:port`, preferring IPv4 addresses if the host name has both
pub async fn resolve_address(address: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = split_host_port(address)?;
    let candidates = tokio::net::lookup_host((host, port)).await?
        .collect::<Vec<_>>();

    let result = candidates.iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| anyhow!("no address found for {}", address))?;

    debug!("resolved {} to {}", address, result);
    Ok(result)
}
