#![forbid(unsafe_code)]

//! Core of the port agent: a long-lived daemon that sits between an
//! oceanographic instrument and its observatory consumers, framing the
//! instrument byte stream into timestamped packets and fanning them out to
//! drivers, sniffers, and a rotating on-disk record.

pub mod agent;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod publish;

pub use agent::{AgentState, PortAgent, SELECT_SLEEP_TIME};
pub use buffer::CircularBuffer;
pub use comm::{SerialDevice, SerialSettings, TcpClient, TcpServer};
pub use config::{AgentCommand, InstrumentType, PortAgentConfig, RotationInterval};
pub use connection::{InstrumentConnection, ObservatoryConnection};
pub use error::{AgentError, Result};
pub use packet::{Packet, PacketType, RawPacketBuffer, StreamFramer, Timestamp};
pub use publish::{DataLog, Publisher, PublisherId, PublisherKind, PublisherList, SinkContext};
