#![forbid(unsafe_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::comm::{BIND_RETRY_INTERVAL, BIND_RETRY_TIMEOUT};
use crate::error::{AgentError, Result};

/// Single-client TCP endpoint: a listener that hands its port over to the
/// first accepted client.
///
/// While listening, the listener socket is live; on accept the accepted
/// stream becomes the client and the listener socket is closed, so at most
/// one peer ever holds the port. When the client goes away the endpoint
/// re-initializes and listens again on the same port.
pub struct TcpServer {
    port: u16,
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            listener: None,
            client: None,
            peer: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn configured(&self) -> bool {
        self.port != 0
    }

    pub fn listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn connected(&self) -> bool {
        self.client.is_some()
    }

    /// Listening or holding a client; either way the port is claimed.
    pub fn initialized(&self) -> bool {
        self.listening() || self.connected()
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    pub fn client(&self) -> Option<&TcpStream> {
        self.client.as_ref()
    }

    /// Port actually bound, useful when configured with port 0.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Bind and listen. Sets SO_REUSEADDR; "address in use" is retried for
    /// a bounded window, any other bind failure is immediate.
    pub async fn initialize(&mut self) -> Result<()> {
        if !self.configured() {
            return Err(AgentError::Config("missing inet port".into()));
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let started = Instant::now();

        let std_listener = loop {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
                .map_err(|e| AgentError::SocketCreateFailure(e.to_string()))?;
            socket
                .set_reuse_address(true)
                .map_err(|e| AgentError::SocketCreateFailure(e.to_string()))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| AgentError::SocketCreateFailure(e.to_string()))?;

            match socket.bind(&addr.into()) {
                Ok(()) => {
                    socket
                        .listen(1)
                        .map_err(|e| AgentError::SocketBindFailure(e.to_string()))?;
                    break socket.into();
                }
                Err(e)
                    if e.kind() == io::ErrorKind::AddrInUse
                        && started.elapsed() < BIND_RETRY_TIMEOUT =>
                {
                    warn!(port = self.port, "port in use, retrying bind");
                    sleep(BIND_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(AgentError::SocketBindFailure(e.to_string())),
            }
        };

        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| AgentError::SocketCreateFailure(e.to_string()))?;

        info!(port = self.port, "listener bound");
        self.listener = Some(listener);
        Ok(())
    }

    /// Install an accepted stream as the client and close the listener.
    pub fn attach_client(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.connected() {
            return Err(AgentError::SocketAlreadyConnected);
        }

        info!(%peer, port = self.port, "client connected, closing listener");
        self.client = Some(stream);
        self.peer = Some(peer);
        self.listener = None;
        Ok(())
    }

    /// Await and accept one client. Used by paths outside the main
    /// multiplexer (tests, sniffer warm-up).
    pub async fn accept_client(&mut self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or(AgentError::SocketNotInitialized)?;
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| AgentError::SocketConnectFailure(e.to_string()))?;
        self.attach_client(stream, peer)
    }

    /// Non-blocking client read. A zero return with `connected() == false`
    /// afterwards means the peer closed; the endpoint has already gone back
    /// to listening.
    pub async fn read_client(&mut self, buf: &mut [u8]) -> Result<usize> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AgentError::SocketNotConnected("read on listener endpoint".into()))?;

        match client.try_read(buf) {
            Ok(0) => {
                info!(port = self.port, "client closed, returning to listen");
                self.drop_client_and_relisten().await?;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(port = self.port, "client read timeout, disconnecting");
                self.drop_client_and_relisten().await?;
                Ok(0)
            }
            Err(e) => Err(AgentError::SocketReadFailure(e.to_string())),
        }
    }

    /// Write the whole buffer to the client. Not connected is a silent
    /// zero-byte write so unattended ports don't spam faults.
    pub async fn write_client(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(client) = self.client.as_mut() else {
            debug!(port = self.port, "no client, dropping write");
            return Ok(0);
        };

        match client.write_all(buf).await {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                warn!(port = self.port, error = %e, "client write failed, disconnecting");
                self.drop_client_and_relisten().await?;
                Err(AgentError::SocketWriteFailure(e.to_string()))
            }
        }
    }

    /// Drop the client and resume listening; used when a disconnect is
    /// detected outside `read_client`.
    pub async fn reset_client(&mut self) -> Result<()> {
        self.drop_client_and_relisten().await
    }

    async fn drop_client_and_relisten(&mut self) -> Result<()> {
        self.client = None;
        self.peer = None;
        if self.listener.is_none() {
            self.initialize().await?;
        }
        Ok(())
    }

    /// Drop the client without re-listening (full shutdown path).
    pub fn disconnect(&mut self) {
        self.client = None;
        self.peer = None;
        self.listener = None;
    }
}
