use thiserror::Error;

/// Errors raised by the port agent core.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parameter out of range: {0}")]
    ParamOutOfRange(String),

    #[error("packet payload full")]
    PacketOverflow,

    #[error("packet publish failure: {0}")]
    PacketPublishFailure(String),

    #[error("socket create failure: {0}")]
    SocketCreateFailure(String),

    #[error("socket bind failure: {0}")]
    SocketBindFailure(String),

    #[error("socket connect failure: {0}")]
    SocketConnectFailure(String),

    #[error("socket read failure: {0}")]
    SocketReadFailure(String),

    #[error("socket write failure: {0}")]
    SocketWriteFailure(String),

    #[error("socket not connected: {0}")]
    SocketNotConnected(String),

    #[error("socket not initialized")]
    SocketNotInitialized,

    #[error("socket already connected")]
    SocketAlreadyConnected,

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown publisher kind")]
    UnknownPublisherKind,

    #[error("buffer overflow writing raw data")]
    RawBufferOverflow,

    #[error("pid file missing or unreadable: {0}")]
    MissingPid(String),

    #[error("another instance is already running (pid {0})")]
    DuplicateProcess(u32),

    #[error("data log open failure: {0}")]
    LogOpenFailure(String),

    #[error("data log write failure: {0}")]
    LogWriteFailure(String),

    #[error("data log file not set")]
    LogFileNotSet,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
