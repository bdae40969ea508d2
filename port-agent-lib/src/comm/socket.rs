#![forbid(unsafe_code)]

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::comm::CONNECT_TIMEOUT;
use crate::error::{AgentError, Result};

/// Outbound TCP endpoint for the instrument side.
pub struct TcpClient {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_endpoint(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    pub fn configured(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Connect with a bounded timeout.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.configured() {
            return Err(AgentError::Config(
                "missing instrument host or port".into(),
            ));
        }

        let target = format!("{}:{}", self.host, self.port);
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => {
                info!(%target, "instrument endpoint connected");
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(AgentError::SocketConnectFailure(format!("{target}: {e}"))),
            Err(_) => Err(AgentError::SocketConnectFailure(format!(
                "{target}: connect timeout"
            ))),
        }
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Resolve once a read completes. Pends forever while disconnected so
    /// the caller can park it in a multiplexer unconditionally.
    pub async fn wait_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_ref() else {
            return std::future::pending().await;
        };

        loop {
            stream.readable().await?;
            match stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking read. Zero with `connected() == false` afterwards means
    /// the peer closed.
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| AgentError::SocketNotConnected("instrument read".into()))?;

        match stream.try_read(buf) {
            Ok(0) => {
                info!(host = %self.host, port = self.port, "peer closed connection");
                self.stream = None;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!(host = %self.host, port = self.port, "read timeout, disconnecting");
                self.stream = None;
                Ok(0)
            }
            Err(e) => {
                self.stream = None;
                Err(AgentError::SocketReadFailure(e.to_string()))
            }
        }
    }

    /// Write the whole buffer or fail.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AgentError::SocketNotConnected("instrument write".into()))?;

        match stream.write_all(buf).await {
            Ok(()) => {
                debug!(count = buf.len(), "instrument write complete");
                Ok(buf.len())
            }
            Err(e) => {
                self.stream = None;
                Err(AgentError::SocketWriteFailure(e.to_string()))
            }
        }
    }
}
