//! Datagram transport: a thin wrapper over UDP.
//!
//! Nothing here orders, deduplicates, or retries. The reliability layer and
//! the session state machines compensate for that; this module only moves
//! bytes and bounds how long a receive may block.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use ferry_core::wire::MAX_DATAGRAM;
use ferry_core::TransferError;

/// Kernel send/receive buffer size requested for every socket.
const SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

/// An unreliable, unordered datagram channel bound to one local port.
///
/// Object-safe so the runtimes can hold `Arc<dyn Datagram>` and tests can
/// slot a fault-injecting wrapper in front of a real socket.
pub trait Datagram: Send + Sync {
    /// Fire-and-forget send.
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>>;

    /// Wait for the next datagram. Cancel-safe.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8])
        -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send, mapping socket failures into the transfer error taxonomy.
    fn send<'a>(&'a self, addr: SocketAddr, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move { self.send_to(bytes, addr).await.map_err(TransferError::from) })
    }

    /// Receive one datagram, giving up after `timeout`.
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Result<(Bytes, SocketAddr), TransferError>> {
        Box::pin(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            match tokio::time::timeout(timeout, self.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    buf.truncate(len);
                    Ok((Bytes::from(buf), from))
                }
                Ok(Err(e)) => Err(TransferError::Transport(e)),
                Err(_) => Err(TransferError::Timeout(timeout)),
            }
        })
    }
}

/// Shared handle used by the import loop and the exporter.
pub type SharedTransport = Arc<dyn Datagram>;

/// The real thing: a tokio UDP socket configured through socket2.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr`. Port 0 asks the OS for an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransferError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;

        tracing::debug!(local = %socket.local_addr()?, "udp transport bound");

        Ok(Self { socket })
    }
}

impl Datagram for UdpTransport {
    fn send_to<'a>(&'a self, bytes: &'a [u8], addr: SocketAddr) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let sent = self.socket.send_to(bytes, addr).await?;
            tracing::trace!(%addr, bytes = sent, "datagram sent");
            Ok(())
        })
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
