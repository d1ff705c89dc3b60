//! Datagram transport underneath the UDP connection handler

use std::io;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Largest datagram the UDP API sends
const MAX_DATAGRAM_SIZE: usize = 1400;

/// One request datagram out, one response datagram back
///
/// Timeouts and cancellation are applied by the caller.
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>>;

    /// Drop the current socket so the next exchange starts fresh
    async fn reconnect(&self) -> io::Result<()>;
}

/// [`UdpTransport`] over a real socket bound to a fixed local port
///
/// AniDB identifies clients by their source port, so the local port is
/// configured rather than ephemeral.
#[derive(Debug)]
pub struct SocketTransport {
    server_addr: String,
    local_port: u16,
    socket: Mutex<Option<UdpSocket>>,
}

impl SocketTransport {
    pub fn new(server_addr: impl Into<String>, local_port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            local_port,
            socket: Mutex::new(None),
        }
    }

    async fn connect(&self) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(("0.0.0.0", self.local_port)).await?;
        socket.connect(&self.server_addr).await?;
        info!(
            server = %self.server_addr,
            local_port = self.local_port,
            "AniDB UDP socket connected"
        );
        Ok(socket)
    }
}

#[async_trait]
impl UdpTransport for SocketTransport {
    async fn exchange(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(socket) = guard.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket unavailable"));
        };

        let result: io::Result<Vec<u8>> = async {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            // Discard late replies to requests that timed out
            while socket.try_recv(&mut buf).is_ok() {}

            socket.send(request).await?;
            let len = socket.recv(&mut buf).await?;
            buf.truncate(len);
            Ok(buf)
        }
        .await;

        if result.is_err() {
            // Force a fresh bind on the next exchange
            *guard = None;
        }
        result
    }

    async fn reconnect(&self) -> io::Result<()> {
        let mut guard = self.socket.lock().await;
        if guard.take().is_some() {
            debug!(server = %self.server_addr, "AniDB UDP socket closed");
        }
        Ok(())
    }
}
