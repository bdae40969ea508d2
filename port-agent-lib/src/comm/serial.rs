#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::OFlag;
use nix::sys::termios::{
    cfmakeraw, cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
    SetArg,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Serial line parameters. Domains are enforced by the configuration
/// parser; zero baud means "not configured yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub databits: u16,
    pub stopbits: u16,
    pub parity: u16,
    pub flow: u16,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 0,
            databits: 8,
            stopbits: 1,
            parity: 0,
            flow: 0,
        }
    }
}

/// Byte-duplex channel over a serial device node.
///
/// The device is opened non-blocking; line settings are applied through
/// termios and can be re-applied without reopening. Reopening is only
/// needed when the device path itself changes.
pub struct SerialDevice {
    path: String,
    settings: SerialSettings,
    fd: Option<AsyncFd<File>>,
}

impl SerialDevice {
    pub fn new() -> Self {
        Self {
            path: String::new(),
            settings: SerialSettings::default(),
            fd: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: SerialSettings) {
        self.settings = settings;
    }

    pub fn configured(&self) -> bool {
        !self.path.is_empty() && self.settings.baud != 0
    }

    pub fn connected(&self) -> bool {
        self.fd.is_some()
    }

    /// Open (or reopen) the device and apply the current line settings.
    pub fn open(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Err(AgentError::Config("missing serial device path".into()));
        }

        self.fd = None;

        let flags = OFlag::O_NONBLOCK | OFlag::O_NOCTTY;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags.bits())
            .open(&self.path)
            .map_err(|e| AgentError::SocketConnectFailure(format!("{}: {e}", self.path)))?;

        let fd = AsyncFd::new(file)
            .map_err(|e| AgentError::SocketCreateFailure(e.to_string()))?;

        info!(path = %self.path, "serial device opened");
        self.fd = Some(fd);
        self.apply_settings()
    }

    /// Push the line settings to the open device without reopening.
    pub fn apply_settings(&mut self) -> Result<()> {
        let fd = self.fd.as_ref().ok_or(AgentError::SocketNotInitialized)?;
        let file = fd.get_ref();

        let mut termios = tcgetattr(file)
            .map_err(|e| AgentError::SocketCreateFailure(format!("tcgetattr: {e}")))?;

        cfmakeraw(&mut termios);

        let baud = baud_rate(self.settings.baud)?;
        cfsetispeed(&mut termios, baud)
            .map_err(|e| AgentError::SocketCreateFailure(format!("cfsetispeed: {e}")))?;
        cfsetospeed(&mut termios, baud)
            .map_err(|e| AgentError::SocketCreateFailure(format!("cfsetospeed: {e}")))?;

        termios.control_flags &= !ControlFlags::CSIZE;
        termios.control_flags |= match self.settings.databits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        };

        if self.settings.stopbits == 2 {
            termios.control_flags |= ControlFlags::CSTOPB;
        } else {
            termios.control_flags &= !ControlFlags::CSTOPB;
        }

        termios.control_flags &= !(ControlFlags::PARENB | ControlFlags::PARODD);
        match self.settings.parity {
            1 => {
                termios.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
            }
            2 => {
                termios.control_flags |= ControlFlags::PARENB;
            }
            _ => {}
        }

        termios.control_flags &= !ControlFlags::CRTSCTS;
        termios.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF);
        match self.settings.flow {
            1 => {
                termios.control_flags |= ControlFlags::CRTSCTS;
            }
            2 => {
                termios.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
            }
            _ => {}
        }

        termios.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;

        tcsetattr(file, SetArg::TCSANOW, &termios)
            .map_err(|e| AgentError::SocketCreateFailure(format!("tcsetattr: {e}")))?;

        debug!(path = %self.path, baud = self.settings.baud, "serial settings applied");
        Ok(())
    }

    pub fn close(&mut self) {
        self.fd = None;
    }

    /// Wait until a read completes and return the byte count.
    pub async fn wait_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(fd) = self.fd.as_ref() else {
            return std::future::pending().await;
        };

        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, waiting for writability as needed.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<usize> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| AgentError::SocketNotConnected("serial write".into()))?;

        let total = buf.len();
        while !buf.is_empty() {
            let mut guard = fd
                .writable()
                .await
                .map_err(|e| AgentError::SocketWriteFailure(e.to_string()))?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(AgentError::SocketWriteFailure(e.to_string())),
                Err(_would_block) => continue,
            }
        }
        Ok(total)
    }
}

impl Default for SerialDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate> {
    match baud {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(AgentError::ParamOutOfRange(format!(
            "unsupported baud rate {other}"
        ))),
    }
}
