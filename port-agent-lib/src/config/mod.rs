#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::error::{AgentError, Result};

pub const DEFAULT_PACKET_SIZE: usize = 1024;
pub const MAX_PACKET_SIZE: usize = 65472;
pub const DEFAULT_DIR: &str = "/tmp";
pub const BASE_FILENAME: &str = "port_agent";

/// Which kind of instrument the agent fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentType {
    #[default]
    Unknown,
    Serial,
    Tcp,
    Rsn,
    Botpt,
}

impl InstrumentType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Serial => "serial",
            Self::Tcp => "tcp",
            Self::Rsn => "rsn",
            Self::Botpt => "botpt",
        }
    }
}

/// Data-log roll cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationInterval {
    #[default]
    Daily,
    Hourly,
}

/// Typed intents produced by the control-protocol parser, drained by the
/// state machine in FIFO order. Duplicates are coalesced while queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    Help,
    CommConfigUpdate,
    PublisherConfigUpdate,
    PathConfigUpdate,
    SaveConfig,
    GetConfig,
    GetState,
    Ping,
    Break,
    Shutdown,
    RotationInterval,
}

/// Agent settings plus the pending command queue.
///
/// All mutation goes through the line parser so the value domains are
/// enforced in one place; the configuration file is simply a stored
/// sequence of the same commands.
#[derive(Debug)]
pub struct PortAgentConfig {
    commands: VecDeque<AgentCommand>,

    pub observatory_command_port: u16,
    pub observatory_data_port: u16,

    pub instrument_type: InstrumentType,
    pub instrument_addr: String,
    pub instrument_data_port: u16,
    pub instrument_command_port: u16,
    pub instrument_data_tx_port: u16,
    pub instrument_data_rx_port: u16,

    pub device_path: String,
    pub baud: u32,
    pub stopbits: u16,
    pub databits: u16,
    pub parity: u16,
    pub flow: u16,

    pub sentinel: Vec<u8>,
    pub output_throttle: u32,
    pub heartbeat_interval: u32,
    pub max_packet_size: usize,
    pub break_duration: u32,
    pub rotation_interval: RotationInterval,

    pub telnet_sniffer_port: u16,
    pub telnet_sniffer_prefix: String,
    pub telnet_sniffer_suffix: String,

    pub log_level: String,
    pub pid_dir: String,
    pub log_dir: String,
    pub conf_dir: String,
    pub data_dir: String,

    device_path_changed: bool,
    serial_settings_changed: bool,
}

impl PortAgentConfig {
    pub fn new() -> Self {
        Self {
            commands: VecDeque::new(),
            observatory_command_port: 0,
            observatory_data_port: 0,
            instrument_type: InstrumentType::Unknown,
            instrument_addr: String::new(),
            instrument_data_port: 0,
            instrument_command_port: 0,
            instrument_data_tx_port: 0,
            instrument_data_rx_port: 0,
            device_path: String::new(),
            baud: 0,
            stopbits: 1,
            databits: 8,
            parity: 0,
            flow: 0,
            sentinel: Vec::new(),
            output_throttle: 0,
            heartbeat_interval: 0,
            max_packet_size: DEFAULT_PACKET_SIZE,
            break_duration: 0,
            rotation_interval: RotationInterval::Daily,
            telnet_sniffer_port: 0,
            telnet_sniffer_prefix: String::new(),
            telnet_sniffer_suffix: String::new(),
            log_level: "info".to_string(),
            pid_dir: DEFAULT_DIR.to_string(),
            log_dir: DEFAULT_DIR.to_string(),
            conf_dir: DEFAULT_DIR.to_string(),
            data_dir: DEFAULT_DIR.to_string(),
            device_path_changed: false,
            serial_settings_changed: false,
        }
    }

    //////
    // Command queue
    //////

    /// Pop the oldest pending command.
    pub fn next_command(&mut self) -> Option<AgentCommand> {
        self.commands.pop_front()
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    fn queue_command(&mut self, command: AgentCommand) {
        if self.commands.contains(&command) {
            debug!(?command, "command already queued, coalescing");
            return;
        }
        debug!(?command, "command queued");
        self.commands.push_back(command);
    }

    //////
    // Dirty flags for the serial connection
    //////

    pub fn device_path_changed(&self) -> bool {
        self.device_path_changed
    }

    pub fn clear_device_path_changed(&mut self) {
        self.device_path_changed = false;
    }

    pub fn serial_settings_changed(&self) -> bool {
        self.serial_settings_changed
    }

    pub fn clear_serial_settings_changed(&mut self) {
        self.serial_settings_changed = false;
    }

    //////
    // Derived paths
    //////

    pub fn conffile_path(&self) -> PathBuf {
        PathBuf::from(&self.conf_dir).join(format!(
            "{BASE_FILENAME}_{}.conf",
            self.observatory_command_port
        ))
    }

    pub fn pidfile_path(&self) -> PathBuf {
        PathBuf::from(&self.pid_dir).join(format!(
            "{BASE_FILENAME}_{}.pid",
            self.observatory_command_port
        ))
    }

    /// Base name for the rotating data log; the date and `.data` extension
    /// are appended by the log itself.
    pub fn datafile_base(&self) -> PathBuf {
        PathBuf::from(&self.log_dir).join(format!(
            "{BASE_FILENAME}_{}",
            self.observatory_command_port
        ))
    }

    //////
    // Completeness
    //////

    /// Do we know enough to bring the agent up?
    pub fn is_configured(&self) -> bool {
        let mut ready = true;

        if self.instrument_type == InstrumentType::Unknown {
            debug!("missing instrument connection type");
            ready = false;
        }

        if self.observatory_command_port == 0 {
            debug!("missing observatory command port");
            ready = false;
        }

        if self.observatory_data_port == 0 {
            debug!("missing observatory data port");
            ready = false;
        }

        if matches!(self.instrument_type, InstrumentType::Tcp | InstrumentType::Rsn) {
            if self.instrument_addr.is_empty() {
                debug!("missing instrument address");
                ready = false;
            }
            if self.instrument_data_port == 0 {
                debug!("missing instrument data port");
                ready = false;
            }
        }

        if self.instrument_type == InstrumentType::Rsn && self.instrument_command_port == 0 {
            debug!("missing instrument command port");
            ready = false;
        }

        if self.instrument_type == InstrumentType::Serial && self.baud == 0 {
            debug!("missing baud rate");
            ready = false;
        }

        if self.instrument_type == InstrumentType::Botpt {
            if self.instrument_data_tx_port == 0 {
                debug!("missing instrument data tx port");
                ready = false;
            }
            if self.instrument_data_rx_port == 0 {
                debug!("missing instrument data rx port");
                ready = false;
            }
        }

        ready
    }

    //////
    // Parsing
    //////

    /// Parse newline-delimited commands. A failed line is logged and
    /// skipped; later lines are still processed. Returns true when every
    /// line parsed.
    pub fn parse(&mut self, commands: &str) -> bool {
        let mut all_ok = true;

        for line in commands.lines() {
            if line.trim().is_empty() {
                continue;
            }
            debug!(line, "config command");
            if !self.process_command(line) {
                error!(line, "failed to parse command");
                all_ok = false;
            }
        }

        all_ok
    }

    /// Load a configuration file: its body is a sequence of control-port
    /// commands handled by the same parser.
    pub fn load_file(&mut self, path: &Path) -> Result<bool> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "reading configuration");
        Ok(self.parse(&text))
    }

    /// Write the current configuration as a replayable command sequence.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.dump())
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn process_command(&mut self, line: &str) -> bool {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (cmd, param, clean) = split_command(trimmed);

        // Pure verbs match the whole line.
        match trimmed {
            "help" => {
                self.queue_command(AgentCommand::Help);
                return true;
            }
            "verbose" => {
                self.log_level = more_verbose(&self.log_level).to_string();
                return true;
            }
            "save_config" => {
                self.queue_command(AgentCommand::SaveConfig);
                return true;
            }
            "get_config" => {
                self.queue_command(AgentCommand::GetConfig);
                return true;
            }
            "get_state" => {
                self.queue_command(AgentCommand::GetState);
                return true;
            }
            "ping" => {
                self.queue_command(AgentCommand::Ping);
                return true;
            }
            "shutdown" => {
                self.queue_command(AgentCommand::Shutdown);
                return true;
            }
            _ => {}
        }

        // The sentinel value is quoted and may hold spaces, so it bypasses
        // the trailing-garbage rule and parses from the raw line.
        if cmd == "sentinel" {
            self.queue_command(AgentCommand::PublisherConfigUpdate);
            return self.set_sentinel(trimmed);
        }

        if cmd == "break" {
            self.queue_command(AgentCommand::Break);
            return self.set_break_duration(param);
        }

        if cmd == "rotation_interval" {
            self.queue_command(AgentCommand::RotationInterval);
            return self.set_rotation_interval(param);
        }

        if !clean {
            error!(line, "trailing tokens after command value");
            return false;
        }

        match cmd {
            "instrument_type" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_instrument_type(param)
            }
            "output_throttle" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_output_throttle(param)
            }
            "max_packet_size" => {
                self.queue_command(AgentCommand::PublisherConfigUpdate);
                self.set_max_packet_size(param)
            }
            "heartbeat_interval" => {
                self.queue_command(AgentCommand::PublisherConfigUpdate);
                self.set_heartbeat_interval(param)
            }
            "data_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(&mut self.observatory_data_port, param, "data_port")
            }
            "command_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(&mut self.observatory_command_port, param, "command_port")
            }
            "instrument_addr" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.instrument_addr = param.to_string();
                !self.instrument_addr.is_empty()
            }
            "instrument_data_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(&mut self.instrument_data_port, param, "instrument_data_port")
            }
            "instrument_command_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(
                    &mut self.instrument_command_port,
                    param,
                    "instrument_command_port",
                )
            }
            "instrument_data_tx_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(
                    &mut self.instrument_data_tx_port,
                    param,
                    "instrument_data_tx_port",
                )
            }
            "instrument_data_rx_port" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                set_port(
                    &mut self.instrument_data_rx_port,
                    param,
                    "instrument_data_rx_port",
                )
            }
            "telnet_sniffer_port" => {
                self.queue_command(AgentCommand::PublisherConfigUpdate);
                set_port(&mut self.telnet_sniffer_port, param, "telnet_sniffer_port")
            }
            "telnet_sniffer_prefix" => {
                self.queue_command(AgentCommand::PublisherConfigUpdate);
                self.telnet_sniffer_prefix = param.to_string();
                true
            }
            "telnet_sniffer_suffix" => {
                self.queue_command(AgentCommand::PublisherConfigUpdate);
                self.telnet_sniffer_suffix = param.to_string();
                true
            }
            "device_path" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                if param.is_empty() {
                    return false;
                }
                if self.device_path != param {
                    self.device_path_changed = true;
                }
                self.device_path = param.to_string();
                true
            }
            "baud" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_baud(param)
            }
            "stopbits" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_stopbits(param)
            }
            "databits" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_databits(param)
            }
            "parity" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_parity(param)
            }
            "flow" => {
                self.queue_command(AgentCommand::CommConfigUpdate);
                self.set_flow(param)
            }
            "log_level" => self.set_log_level(param),
            "log_dir" => {
                self.queue_command(AgentCommand::PathConfigUpdate);
                self.log_dir = param.to_string();
                !self.log_dir.is_empty()
            }
            "pid_dir" => {
                self.queue_command(AgentCommand::PathConfigUpdate);
                self.pid_dir = param.to_string();
                !self.pid_dir.is_empty()
            }
            "data_dir" => {
                self.queue_command(AgentCommand::PathConfigUpdate);
                self.data_dir = param.to_string();
                !self.data_dir.is_empty()
            }
            "conf_dir" => {
                self.queue_command(AgentCommand::PathConfigUpdate);
                self.conf_dir = param.to_string();
                !self.conf_dir.is_empty()
            }
            _ => {
                error!(line, "unknown command");
                false
            }
        }
    }

    //////
    // Setters with domain checks
    //////

    fn set_instrument_type(&mut self, param: &str) -> bool {
        self.instrument_type = match param {
            "serial" => InstrumentType::Serial,
            "tcp" => InstrumentType::Tcp,
            "rsn" => InstrumentType::Rsn,
            "botpt" => InstrumentType::Botpt,
            other => {
                error!(value = other, "unknown instrument connection type");
                self.instrument_type = InstrumentType::Unknown;
                return false;
            }
        };
        info!(value = param, "instrument connection type set");
        true
    }

    /// Sentinel values arrive single-quoted with `\n`/`\r` escapes so line
    /// terminators can be part of the sequence. An empty quoted string
    /// clears the sentinel.
    fn set_sentinel(&mut self, line: &str) -> bool {
        let Some(open) = line.find('\'') else {
            error!(line, "sentinel value must be single-quoted");
            return false;
        };
        let rest = &line[open + 1..];
        let Some(close) = rest.find('\'') else {
            error!(line, "unterminated sentinel value");
            return false;
        };

        let raw = rest[..close].as_bytes();
        let mut value = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] == b'\\' && i + 1 < raw.len() && raw[i + 1] == b'n' {
                value.push(b'\n');
                i += 2;
            } else if raw[i] == b'\\' && i + 1 < raw.len() && raw[i + 1] == b'r' {
                value.push(b'\r');
                i += 2;
            } else {
                value.push(raw[i]);
                i += 1;
            }
        }

        debug!(length = value.len(), "sentinel sequence set");
        self.sentinel = value;
        true
    }

    fn set_output_throttle(&mut self, param: &str) -> bool {
        match param.parse::<i64>() {
            Ok(value) if value >= 0 => {
                info!(value, "output throttle set");
                self.output_throttle = value as u32;
                true
            }
            _ => {
                error!(value = param, "invalid output throttle");
                self.output_throttle = 0;
                false
            }
        }
    }

    fn set_heartbeat_interval(&mut self, param: &str) -> bool {
        match param.parse::<i64>() {
            Ok(value) if value >= 0 => {
                info!(value, "heartbeat interval set");
                self.heartbeat_interval = value as u32;
                true
            }
            _ => {
                error!(value = param, "invalid heartbeat interval");
                false
            }
        }
    }

    fn set_max_packet_size(&mut self, param: &str) -> bool {
        match param.parse::<i64>() {
            Ok(value) if value > 0 && value <= MAX_PACKET_SIZE as i64 => {
                info!(value, "max packet size set");
                self.max_packet_size = value as usize;
                true
            }
            _ => {
                error!(
                    value = param,
                    default = DEFAULT_PACKET_SIZE,
                    "invalid max packet size, using default"
                );
                self.max_packet_size = DEFAULT_PACKET_SIZE;
                false
            }
        }
    }

    fn set_break_duration(&mut self, param: &str) -> bool {
        if param.is_empty() {
            self.break_duration = 0;
            return true;
        }
        match param.parse::<u32>() {
            Ok(value) => {
                self.break_duration = value;
                true
            }
            Err(_) => {
                error!(value = param, "invalid break duration");
                false
            }
        }
    }

    fn set_rotation_interval(&mut self, param: &str) -> bool {
        self.rotation_interval = match param {
            "" | "daily" => RotationInterval::Daily,
            "hourly" => RotationInterval::Hourly,
            other => {
                error!(value = other, "invalid rotation interval");
                return false;
            }
        };
        true
    }

    fn set_baud(&mut self, param: &str) -> bool {
        const RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];
        match param.parse::<u32>() {
            Ok(value) if RATES.contains(&value) => {
                self.baud = value;
                self.serial_settings_changed = true;
                true
            }
            _ => {
                error!(value = param, "invalid baud rate");
                self.baud = 0;
                false
            }
        }
    }

    fn set_stopbits(&mut self, param: &str) -> bool {
        match param.parse::<u16>() {
            Ok(value @ (1 | 2)) => {
                self.stopbits = value;
                self.serial_settings_changed = true;
                true
            }
            _ => {
                error!(value = param, "invalid stop bits");
                self.stopbits = 1;
                false
            }
        }
    }

    fn set_databits(&mut self, param: &str) -> bool {
        match param.parse::<u16>() {
            Ok(value @ 5..=8) => {
                self.databits = value;
                self.serial_settings_changed = true;
                true
            }
            _ => {
                error!(value = param, "invalid data bits");
                self.databits = 8;
                false
            }
        }
    }

    fn set_parity(&mut self, param: &str) -> bool {
        match param.parse::<u16>() {
            Ok(value @ 0..=2) => {
                self.parity = value;
                self.serial_settings_changed = true;
                true
            }
            _ => {
                error!(value = param, "invalid parity");
                self.parity = 0;
                false
            }
        }
    }

    fn set_flow(&mut self, param: &str) -> bool {
        match param.parse::<u16>() {
            Ok(value @ 0..=2) => {
                self.flow = value;
                self.serial_settings_changed = true;
                true
            }
            _ => {
                error!(value = param, "invalid flow control");
                self.flow = 0;
                false
            }
        }
    }

    fn set_log_level(&mut self, param: &str) -> bool {
        let level = param.to_ascii_lowercase();
        let level = if level == "warning" { "warn".into() } else { level };
        match level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {
                self.log_level = level;
                true
            }
            _ => {
                error!(value = param, "invalid log level");
                false
            }
        }
    }

    //////
    // Dump
    //////

    /// Render the configuration as a command sequence the parser can load
    /// back. Used by `get_config` and `save_config`.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "pid_dir {}", self.pid_dir);
        let _ = writeln!(out, "log_dir {}", self.log_dir);
        let _ = writeln!(out, "conf_dir {}", self.conf_dir);
        let _ = writeln!(out, "data_dir {}", self.data_dir);
        let _ = writeln!(out, "log_level {}", self.log_level);
        if self.observatory_command_port != 0 {
            let _ = writeln!(out, "command_port {}", self.observatory_command_port);
        }
        if self.observatory_data_port != 0 {
            let _ = writeln!(out, "data_port {}", self.observatory_data_port);
        }

        if self.instrument_type != InstrumentType::Unknown {
            let _ = writeln!(out, "instrument_type {}", self.instrument_type.name());
        }

        out.push_str("sentinel '");
        for &byte in &self.sentinel {
            match byte {
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                other => out.push(other as char),
            }
        }
        out.push_str("'\n");

        let _ = writeln!(out, "output_throttle {}", self.output_throttle);
        let _ = writeln!(out, "heartbeat_interval {}", self.heartbeat_interval);
        let _ = writeln!(out, "max_packet_size {}", self.max_packet_size);

        if self.baud != 0 {
            let _ = writeln!(out, "baud {}", self.baud);
        }
        let _ = writeln!(out, "stopbits {}", self.stopbits);
        let _ = writeln!(out, "databits {}", self.databits);
        let _ = writeln!(out, "parity {}", self.parity);
        let _ = writeln!(out, "flow {}", self.flow);

        if !self.device_path.is_empty() {
            let _ = writeln!(out, "device_path {}", self.device_path);
        }

        if !self.instrument_addr.is_empty() {
            let _ = writeln!(out, "instrument_addr {}", self.instrument_addr);
        }
        if self.instrument_data_port != 0 {
            let _ = writeln!(out, "instrument_data_port {}", self.instrument_data_port);
        }
        if self.instrument_command_port != 0 {
            let _ = writeln!(
                out,
                "instrument_command_port {}",
                self.instrument_command_port
            );
        }
        if self.instrument_data_tx_port != 0 {
            let _ = writeln!(
                out,
                "instrument_data_tx_port {}",
                self.instrument_data_tx_port
            );
        }
        if self.instrument_data_rx_port != 0 {
            let _ = writeln!(
                out,
                "instrument_data_rx_port {}",
                self.instrument_data_rx_port
            );
        }

        if self.telnet_sniffer_port != 0 {
            let _ = writeln!(out, "telnet_sniffer_port {}", self.telnet_sniffer_port);
        }
        if !self.telnet_sniffer_prefix.is_empty() {
            let _ = writeln!(out, "telnet_sniffer_prefix {}", self.telnet_sniffer_prefix);
        }
        if !self.telnet_sniffer_suffix.is_empty() {
            let _ = writeln!(out, "telnet_sniffer_suffix {}", self.telnet_sniffer_suffix);
        }

        out
    }
}

impl Default for PortAgentConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a line into command and single parameter; `clean` is false when
/// trailing tokens remain after the value.
fn split_command(line: &str) -> (&str, &str, bool) {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or("");
    let param = parts.next().unwrap_or("");
    let clean = parts.next().is_none();
    (cmd, param, clean)
}

fn set_port(slot: &mut u16, param: &str, name: &str) -> bool {
    match param.parse::<i64>() {
        Ok(value) if value > 0 && value <= 65535 => {
            info!(port = value, name, "port set");
            *slot = value as u16;
            true
        }
        _ => {
            error!(value = param, name, "invalid port specification");
            *slot = 0;
            false
        }
    }
}

fn more_verbose(level: &str) -> &'static str {
    match level {
        "error" => "warn",
        "warn" => "info",
        "info" => "debug",
        _ => "trace",
    }
}
