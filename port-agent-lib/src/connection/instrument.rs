#![forbid(unsafe_code)]

use std::io;

use tracing::info;

use crate::comm::{SerialDevice, TcpClient};
use crate::config::InstrumentType;
use crate::error::{AgentError, Result};
use crate::packet::RawPacketBuffer;

/// Plain TCP instrument: a single connected data socket.
pub struct InstrumentTcp {
    pub data: TcpClient,
}

/// RSN digi instrument: a data socket whose inbound bytes are already
/// port-agent frames, plus a command socket for digi control.
pub struct InstrumentRsn {
    pub data: TcpClient,
    pub command: TcpClient,
    pub buffer: RawPacketBuffer,
}

/// BOTPT instrument: split transmit and receive sockets.
pub struct InstrumentBotpt {
    pub tx: TcpClient,
    pub rx: TcpClient,
}

/// Serial instrument: one byte-duplex device.
pub struct InstrumentSerial {
    pub device: SerialDevice,
}

/// The instrument side of the agent, one of four compositions.
pub enum InstrumentConnection {
    Tcp(InstrumentTcp),
    Rsn(InstrumentRsn),
    Botpt(InstrumentBotpt),
    Serial(InstrumentSerial),
}

impl InstrumentConnection {
    pub fn kind(&self) -> InstrumentType {
        match self {
            Self::Tcp(_) => InstrumentType::Tcp,
            Self::Rsn(_) => InstrumentType::Rsn,
            Self::Botpt(_) => InstrumentType::Botpt,
            Self::Serial(_) => InstrumentType::Serial,
        }
    }

    pub fn data_configured(&self) -> bool {
        match self {
            Self::Tcp(c) => c.data.configured(),
            Self::Rsn(c) => c.data.configured() && c.command.configured(),
            Self::Botpt(c) => c.tx.configured() && c.rx.configured(),
            Self::Serial(c) => c.device.configured(),
        }
    }

    /// For client-style endpoints initialization and connection coincide.
    pub fn data_initialized(&self) -> bool {
        self.data_connected()
    }

    pub fn data_connected(&self) -> bool {
        match self {
            Self::Tcp(c) => c.data.connected(),
            Self::Rsn(c) => c.data.connected(),
            Self::Botpt(c) => c.tx.connected() && c.rx.connected(),
            Self::Serial(c) => c.device.connected(),
        }
    }

    pub fn command_connected(&self) -> bool {
        match self {
            Self::Rsn(c) => c.command.connected(),
            _ => false,
        }
    }

    /// Every endpoint of the composition is up.
    pub fn connected(&self) -> bool {
        match self {
            Self::Rsn(c) => c.data.connected() && c.command.connected(),
            other => other.data_connected(),
        }
    }

    /// Connect (or open) all endpoints of the composition.
    pub async fn initialize(&mut self) -> Result<()> {
        match self {
            Self::Tcp(c) => {
                if !c.data.connected() {
                    c.data.connect().await?;
                }
            }
            Self::Rsn(c) => {
                if !c.data.connected() {
                    c.data.connect().await?;
                }
                if !c.command.connected() {
                    if let Err(e) = c.command.connect().await {
                        c.data.disconnect();
                        return Err(e);
                    }
                }
            }
            Self::Botpt(c) => {
                if !c.tx.connected() {
                    c.tx.connect().await?;
                }
                if !c.rx.connected() {
                    if let Err(e) = c.rx.connect().await {
                        c.tx.disconnect();
                        return Err(e);
                    }
                }
            }
            Self::Serial(c) => {
                if !c.device.connected() {
                    c.device.open()?;
                }
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        info!(kind = self.kind().name(), "disconnecting instrument");
        match self {
            Self::Tcp(c) => c.data.disconnect(),
            Self::Rsn(c) => {
                c.data.disconnect();
                c.command.disconnect();
            }
            Self::Botpt(c) => {
                c.tx.disconnect();
                c.rx.disconnect();
            }
            Self::Serial(c) => c.device.close(),
        }
    }

    /// Resolve once a read from the instrument's inbound endpoint
    /// completes; pends forever while disconnected so it can sit in a
    /// multiplexer unconditionally.
    pub async fn wait_read_data(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(c) => c.data.wait_read(buf).await,
            Self::Rsn(c) => c.data.wait_read(buf).await,
            Self::Botpt(c) => c.rx.wait_read(buf).await,
            Self::Serial(c) => c.device.wait_read(buf).await,
        }
    }

    /// Outbound data path: Tx socket for BOTPT, the data endpoint
    /// otherwise.
    pub async fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Self::Tcp(c) => c.data.write_all(buf).await,
            Self::Rsn(c) => c.data.write_all(buf).await,
            Self::Botpt(c) => c.tx.write_all(buf).await,
            Self::Serial(c) => c.device.write_all(buf).await,
        }
    }

    /// Command path; only the RSN composition has one.
    pub async fn write_command(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Self::Rsn(c) => c.command.write_all(buf).await,
            _ => Err(AgentError::SocketNotConnected(
                "no instrument command endpoint".into(),
            )),
        }
    }

    /// Frame reassembly buffer for an RSN upstream.
    pub fn rsn_buffer_mut(&mut self) -> Option<&mut RawPacketBuffer> {
        match self {
            Self::Rsn(c) => Some(&mut c.buffer),
            _ => None,
        }
    }
}
