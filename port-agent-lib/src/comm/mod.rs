#![forbid(unsafe_code)]

pub mod listener;
pub mod serial;
pub mod socket;

pub use listener::TcpServer;
pub use serial::{SerialDevice, SerialSettings};
pub use socket::TcpClient;

use std::time::Duration;

/// How long a listener keeps retrying a bind that fails with
/// "address in use" before giving up on the connection.
pub const BIND_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between bind retries.
pub const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling on one instrument connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
