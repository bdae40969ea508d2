#![forbid(unsafe_code)]

pub mod datalog;

pub use datalog::DataLog;

use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::comm::{TcpClient, TcpServer};
use crate::config::RotationInterval;
use crate::connection::InstrumentConnection;
use crate::error::{AgentError, Result};
use crate::packet::{Packet, PacketType};

/// Discriminates publishers for the list's replacement rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherKind {
    DriverCommand,
    DriverData,
    InstrumentCommand,
    InstrumentData,
    File,
    TelnetSniffer,
    Tcp,
    Udp,
}

impl PublisherKind {
    /// The four endpoint-bound kinds allow at most one instance.
    fn unique(&self) -> bool {
        matches!(
            self,
            Self::DriverCommand | Self::DriverData | Self::InstrumentCommand | Self::InstrumentData
        )
    }
}

/// Kind plus endpoint identity; two publishers with equal ids are
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherId {
    DriverCommand,
    DriverData,
    InstrumentCommand,
    InstrumentData,
    File {
        filename: Option<PathBuf>,
        base: Option<PathBuf>,
        extension: Option<String>,
    },
    TelnetSniffer {
        port: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
}

/// Endpoints a publish pass is allowed to write to, borrowed from their
/// owners for the duration of the call.
pub struct SinkContext<'a> {
    pub observatory_command: Option<&'a mut TcpServer>,
    pub observatory_data: Option<&'a mut TcpServer>,
    pub instrument: Option<&'a mut InstrumentConnection>,
    pub sniffer: Option<&'a mut TcpServer>,
}

/// One outbound sink, typed by what it is rather than how it writes.
pub enum Publisher {
    /// Observatory command client: status, faults, and data copies, but
    /// only while a supervisor is attached.
    DriverCommand { ascii: bool },
    /// Observatory data client: the instrument-facing stream a driver
    /// consumes.
    DriverData { ascii: bool },
    /// Instrument command endpoint: raw payload bytes, no framing.
    InstrumentCommand,
    /// Instrument data endpoint: raw payload bytes, no framing.
    InstrumentData,
    /// Durable record; sorts to the front of the list.
    File { log: DataLog, ascii: bool },
    /// Live sniffer taps: raw instrument output, optionally wrapped driver
    /// output.
    TelnetSniffer {
        port: u16,
        prefix: Vec<u8>,
        suffix: Vec<u8>,
    },
    /// Side-channel TCP republish.
    Tcp { client: TcpClient, ascii: bool },
    /// Side-channel UDP republish.
    Udp {
        socket: Option<tokio::net::UdpSocket>,
        host: String,
        port: u16,
        ascii: bool,
    },
}

impl Publisher {
    pub fn kind(&self) -> PublisherKind {
        match self {
            Self::DriverCommand { .. } => PublisherKind::DriverCommand,
            Self::DriverData { .. } => PublisherKind::DriverData,
            Self::InstrumentCommand => PublisherKind::InstrumentCommand,
            Self::InstrumentData => PublisherKind::InstrumentData,
            Self::File { .. } => PublisherKind::File,
            Self::TelnetSniffer { .. } => PublisherKind::TelnetSniffer,
            Self::Tcp { .. } => PublisherKind::Tcp,
            Self::Udp { .. } => PublisherKind::Udp,
        }
    }

    pub fn id(&self) -> PublisherId {
        match self {
            Self::DriverCommand { .. } => PublisherId::DriverCommand,
            Self::DriverData { .. } => PublisherId::DriverData,
            Self::InstrumentCommand => PublisherId::InstrumentCommand,
            Self::InstrumentData => PublisherId::InstrumentData,
            Self::File { log, .. } => {
                let (filename, base, extension) = log.identity();
                PublisherId::File {
                    filename: filename.map(Into::into),
                    base: base.map(Into::into),
                    extension: extension.map(Into::into),
                }
            }
            Self::TelnetSniffer { port, .. } => PublisherId::TelnetSniffer { port: *port },
            Self::Tcp { client, .. } => PublisherId::Tcp {
                host: client.host().to_string(),
                port: client.port(),
            },
            Self::Udp { host, port, .. } => PublisherId::Udp {
                host: host.clone(),
                port: *port,
            },
        }
    }

    /// Per-kind type filter.
    pub fn accepts(&self, packet_type: PacketType) -> bool {
        use PacketType::*;

        match self {
            Self::DriverCommand { .. } | Self::File { .. } | Self::Tcp { .. } | Self::Udp { .. } => {
                true
            }
            Self::DriverData { .. } => matches!(
                packet_type,
                DataFromInstrument | PortAgentStatus | PortAgentFault | PortAgentHeartbeat
            ),
            Self::InstrumentCommand => packet_type == InstrumentCommand,
            Self::InstrumentData => packet_type == DataFromDriver,
            Self::TelnetSniffer { prefix, suffix, .. } => match packet_type {
                DataFromInstrument => true,
                DataFromDriver => !prefix.is_empty() || !suffix.is_empty(),
                _ => false,
            },
        }
    }

    /// Write one packet to this sink. Filtered-out types are a silent
    /// success.
    pub async fn publish(&mut self, packet: &Packet, ctx: &mut SinkContext<'_>) -> Result<()> {
        if !self.accepts(packet.packet_type()) {
            return Ok(());
        }

        trace!(kind = ?self.kind(), packet_type = %packet.packet_type(), "publishing packet");

        match self {
            Self::DriverCommand { ascii } => {
                let Some(server) = ctx.observatory_command.as_deref_mut() else {
                    return Ok(());
                };
                if !server.connected() {
                    debug!("command port not connected, not writing packets");
                    return Ok(());
                }
                write_framed(server, packet, *ascii).await
            }
            Self::DriverData { ascii } => {
                let Some(server) = ctx.observatory_data.as_deref_mut() else {
                    return Ok(());
                };
                write_framed(server, packet, *ascii).await
            }
            Self::InstrumentCommand => {
                let instrument = ctx
                    .instrument
                    .as_deref_mut()
                    .ok_or_else(|| AgentError::SocketNotConnected("instrument command".into()))?;
                instrument.write_command(packet.payload()).await.map(|_| ())
            }
            Self::InstrumentData => {
                let instrument = ctx
                    .instrument
                    .as_deref_mut()
                    .ok_or_else(|| AgentError::SocketNotConnected("instrument data".into()))?;
                instrument.write_data(packet.payload()).await.map(|_| ())
            }
            Self::File { log, ascii } => {
                if *ascii {
                    log.write(&packet.as_ascii())
                } else {
                    log.write(packet.as_bytes())
                }
            }
            Self::TelnetSniffer { prefix, suffix, .. } => {
                let Some(server) = ctx.sniffer.as_deref_mut() else {
                    return Ok(());
                };
                if !server.connected() {
                    return Ok(());
                }
                if packet.packet_type() == PacketType::DataFromDriver {
                    if !prefix.is_empty() {
                        server.write_client(prefix).await?;
                    }
                    server.write_client(packet.payload()).await?;
                    if !suffix.is_empty() {
                        server.write_client(suffix).await?;
                    }
                    Ok(())
                } else {
                    server.write_client(packet.payload()).await.map(|_| ())
                }
            }
            Self::Tcp { client, ascii } => {
                if !client.connected() {
                    return Ok(());
                }
                if *ascii {
                    client.write_all(&packet.as_ascii()).await.map(|_| ())
                } else {
                    client.write_all(packet.as_bytes()).await.map(|_| ())
                }
            }
            Self::Udp {
                socket,
                host,
                port,
                ascii,
            } => {
                let Some(socket) = socket.as_ref() else {
                    return Ok(());
                };
                let rendered;
                let bytes: &[u8] = if *ascii {
                    rendered = packet.as_ascii();
                    &rendered
                } else {
                    packet.as_bytes()
                };
                socket
                    .send_to(bytes, (host.as_str(), *port))
                    .await
                    .map_err(|e| AgentError::SocketWriteFailure(e.to_string()))
                    .map(|_| ())
            }
        }
    }
}

async fn write_framed(server: &mut TcpServer, packet: &Packet, ascii: bool) -> Result<()> {
    if ascii {
        server.write_client(&packet.as_ascii()).await.map(|_| ())
    } else {
        server.write_client(packet.as_bytes()).await.map(|_| ())
    }
}

/// Ordered sink collection. File publishers sort to the front so durable
/// capture happens before network fan-out; the four endpoint-bound kinds
/// are unique and replace their predecessor; exact duplicates are dropped.
#[derive(Default)]
pub struct PublisherList {
    publishers: Vec<Publisher>,
}

impl PublisherList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn kinds(&self) -> Vec<PublisherKind> {
        self.publishers.iter().map(Publisher::kind).collect()
    }

    pub fn add(&mut self, publisher: Publisher) {
        let id = publisher.id();
        if self.publishers.iter().any(|existing| existing.id() == id) {
            debug!(?id, "duplicate publisher, not adding");
            return;
        }

        let kind = publisher.kind();
        if kind.unique() {
            self.publishers.retain(|existing| existing.kind() != kind);
        }

        if kind == PublisherKind::File {
            self.publishers.insert(0, publisher);
        } else {
            self.publishers.push(publisher);
        }
    }

    /// Fan one packet out to every sink. Each publisher is attempted even
    /// when earlier ones fail; failures come back keyed by publisher.
    pub async fn publish(
        &mut self,
        packet: &Packet,
        ctx: &mut SinkContext<'_>,
    ) -> Vec<(PublisherId, AgentError)> {
        let mut failures = Vec::new();

        for publisher in &mut self.publishers {
            if let Err(error) = publisher.publish(packet, ctx).await {
                warn!(id = ?publisher.id(), %error, "publisher write failed");
                failures.push((publisher.id(), error));
            }
        }

        failures
    }

    /// Update the roll cadence of any file publisher.
    pub fn set_rotation_interval(&mut self, rotation: RotationInterval) {
        for publisher in &mut self.publishers {
            if let Publisher::File { log, .. } = publisher {
                log.set_rotation(rotation);
            }
        }
    }

    pub fn flush(&mut self) {
        for publisher in &mut self.publishers {
            if let Publisher::File { log, .. } = publisher {
                log.flush();
            }
        }
    }
}

/// Render a failure set into the single aggregated publish error.
pub fn aggregate_failures(failures: &[(PublisherId, AgentError)]) -> AgentError {
    let mut message = String::new();
    for (id, error) in failures {
        message.push_str(&format!("{id:?}: {error}; "));
    }
    AgentError::PacketPublishFailure(message)
}
