#![forbid(unsafe_code)]

use tracing::info;

use crate::comm::TcpServer;
use crate::error::Result;

/// The driver-facing side: one single-client listener for the command port
/// and one for the data port, independently configured and rebindable.
pub struct ObservatoryConnection {
    command: TcpServer,
    data: TcpServer,
}

impl ObservatoryConnection {
    pub fn new() -> Self {
        Self {
            command: TcpServer::new(0),
            data: TcpServer::new(0),
        }
    }

    pub fn command(&self) -> &TcpServer {
        &self.command
    }

    pub fn command_mut(&mut self) -> &mut TcpServer {
        &mut self.command
    }

    pub fn data(&self) -> &TcpServer {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TcpServer {
        &mut self.data
    }

    /// Borrow both listeners at once (command, data).
    pub fn split_mut(&mut self) -> (&mut TcpServer, &mut TcpServer) {
        (&mut self.command, &mut self.data)
    }

    pub fn command_configured(&self) -> bool {
        self.command.configured()
    }

    pub fn data_configured(&self) -> bool {
        self.data.configured()
    }

    pub fn command_initialized(&self) -> bool {
        self.command.initialized()
    }

    pub fn data_initialized(&self) -> bool {
        self.data.initialized()
    }

    pub fn command_connected(&self) -> bool {
        self.command.connected()
    }

    pub fn data_connected(&self) -> bool {
        self.data.connected()
    }

    /// Bring the command listener in line with the configured port,
    /// rebinding if the port changed while listening.
    pub async fn ensure_command(&mut self, port: u16) -> Result<()> {
        if self.command.initialized() && self.command.port() != port {
            info!(
                old = self.command.port(),
                new = port,
                "observatory command port changed, rebinding"
            );
            self.command.disconnect();
        }

        self.command.set_port(port);
        if !self.command.initialized() {
            self.command.initialize().await?;
        }
        Ok(())
    }

    /// Same contract as `ensure_command`, for the data listener.
    pub async fn ensure_data(&mut self, port: u16) -> Result<()> {
        if self.data.initialized() && self.data.port() != port {
            info!(
                old = self.data.port(),
                new = port,
                "observatory data port changed, rebinding"
            );
            self.data.disconnect();
        }

        self.data.set_port(port);
        if !self.data.initialized() {
            self.data.initialize().await?;
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.command.disconnect();
        self.data.disconnect();
    }
}

impl Default for ObservatoryConnection {
    fn default() -> Self {
        Self::new()
    }
}
