//! Datagram transport — one IPv4 UDP socket per process.
//!
//! Nothing here knows about messages or peers. The socket is created
//! through socket2 so buffer sizes can be raised before it is handed to
//! tokio.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use scatter_core::Endpoint;

/// Kernel receive buffer requested for each socket. Bursts of acks from
/// a large fleet arrive faster than one protocol thread drains them.
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on a single `send_to`.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DatagramSocket {
    socket: UdpSocket,
    local: Endpoint,
    write_timeout: Duration,
}

impl DatagramSocket {
    /// Create and bind. Must be called inside a tokio runtime.
    pub fn bind(endpoint: Endpoint) -> Result<Self> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
        socket.set_nonblocking(true).context("set_nonblocking")?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            tracing::debug!(error = %e, "could not raise SO_RCVBUF, using kernel default");
        }
        socket
            .bind(&endpoint.to_socket_addr().into())
            .with_context(|| format!("bind({endpoint})"))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("register socket with tokio")?;
        let local = Endpoint::try_from(socket.local_addr().context("local_addr")?)?;

        tracing::info!(%local, "datagram socket bound");
        Ok(Self {
            socket,
            local,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub async fn send_to(&self, buf: &[u8], to: Endpoint) -> io::Result<usize> {
        match tokio::time::timeout(self.write_timeout, self.socket.send_to(buf, to.to_socket_addr()))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send_to timed out")),
        }
    }

    /// Receive one datagram if one is already queued.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait until a datagram can be read, or `timeout` elapses.
    /// Returns false on timeout.
    pub async fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        match tokio::time::timeout(timeout, self.socket.readable()).await {
            Ok(ready) => ready.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Blocking receive bounded by `timeout`.
    pub async fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
