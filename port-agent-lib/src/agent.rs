#![forbid(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::comm::TcpServer;
use crate::config::{AgentCommand, InstrumentType, PortAgentConfig};
use crate::connection::{
    InstrumentBotpt, InstrumentConnection, InstrumentRsn, InstrumentSerial, InstrumentTcp,
    ObservatoryConnection,
};
use crate::error::{AgentError, Result};
use crate::packet::{Packet, PacketType, RawPacketBuffer, StreamFramer, Timestamp};
use crate::publish::{aggregate_failures, DataLog, Publisher, PublisherList, SinkContext};

/// Multiplexer timeout and the universal tick of the agent.
pub const SELECT_SLEEP_TIME: Duration = Duration::from_secs(1);

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "commands: help verbose save_config get_config get_state ping \
break [ms] shutdown rotation_interval [daily|hourly], or KEY VALUE setters \
(instrument_type, data_port, command_port, instrument_addr, ...)";

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unknown,
    Startup,
    Unconfigured,
    Configured,
    Connected,
    Disconnected,
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Startup => "STARTUP",
            Self::Unconfigured => "UNCONFIGURED",
            Self::Configured => "CONFIGURED",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

/// What woke one pass of the multiplexer.
enum Wake {
    Tick,
    Shutdown,
    WatchClosed,
    ObsCommandAccept(io::Result<(TcpStream, SocketAddr)>),
    ObsCommandRead(io::Result<Vec<u8>>),
    ObsDataAccept(io::Result<(TcpStream, SocketAddr)>),
    ObsDataRead(io::Result<Vec<u8>>),
    InstrumentRead(io::Result<Vec<u8>>),
    SnifferAccept(io::Result<(TcpStream, SocketAddr)>),
    SnifferRead(io::Result<usize>),
}

/// The port agent: owns every endpoint, the publisher fan-out, and the
/// configuration, and drives them from a single-task event loop.
pub struct PortAgent {
    config: PortAgentConfig,
    state: AgentState,
    publishers: PublisherList,
    observatory: ObservatoryConnection,
    instrument: Option<InstrumentConnection>,
    sniffer: Option<TcpServer>,
    framer: Option<StreamFramer>,
    command_accum: Vec<u8>,
    last_heartbeat: Instant,
    shutdown: bool,
    watch_closed: bool,
}

impl PortAgent {
    pub fn new(config: PortAgentConfig) -> Self {
        Self {
            config,
            state: AgentState::Startup,
            publishers: PublisherList::new(),
            observatory: ObservatoryConnection::new(),
            instrument: None,
            sniffer: None,
            framer: None,
            command_accum: Vec::new(),
            last_heartbeat: Instant::now(),
            shutdown: false,
            watch_closed: false,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config(&self) -> &PortAgentConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PortAgentConfig {
        &mut self.config
    }

    /// Main loop. Runs until a shutdown command or signal latches the
    /// shutdown flag, then flushes and closes everything.
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let mut tick = interval(SELECT_SLEEP_TIME);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown {
            match self.state {
                AgentState::Startup => self.handle_startup().await?,
                AgentState::Configured => self.handle_configured().await,
                AgentState::Unknown => {
                    return Err(AgentError::Config("agent in unknown state".into()));
                }
                _ => self.poll_once(&mut tick, &mut shutdown_rx).await,
            }
        }

        info!("shutting down");
        self.publishers.flush();
        self.observatory.disconnect();
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.disconnect();
        }
        if let Some(sniffer) = self.sniffer.as_mut() {
            sniffer.disconnect();
        }
        Ok(())
    }

    /// Bring the command listener up; this is the agent's identity, so a
    /// failure here is fatal.
    async fn handle_startup(&mut self) -> Result<()> {
        debug!("startup state handler");
        self.observatory
            .ensure_command(self.config.observatory_command_port)
            .await?;
        self.set_state(AgentState::Unconfigured);
        Ok(())
    }

    /// Configuration is complete: bring every endpoint in line with it and
    /// end up connected or disconnected.
    async fn handle_configured(&mut self) {
        debug!("configured state handler");

        if let Err(e) = self
            .observatory
            .ensure_command(self.config.observatory_command_port)
            .await
        {
            error!(error = %e, "observatory command listener failed");
        }

        if let Err(e) = self
            .observatory
            .ensure_data(self.config.observatory_data_port)
            .await
        {
            error!(error = %e, "observatory data listener failed");
        }

        self.initialize_instrument().await;
        if self.state == AgentState::Configured {
            // Instrument setup could not even start; treat as down and let
            // the reconnect path keep trying.
            self.set_state(AgentState::Disconnected);
        }

        self.initialize_sniffer().await;
        self.initialize_publishers();
        self.rebuild_framer();

        // Ask the digi for binary timestamps once the RSN path is up.
        if self.config.instrument_type == InstrumentType::Rsn
            && self.state == AgentState::Connected
        {
            self.publish_instrument_command("time 1\n").await;
        }
    }

    /// One multiplexer pass: wake on the first ready endpoint or the tick,
    /// service it, then run the per-pass work (quiescent drain, heartbeat,
    /// pending state changes).
    async fn poll_once(&mut self, tick: &mut Interval, shutdown_rx: &mut watch::Receiver<bool>) {
        let wake = {
            let observatory = &self.observatory;
            let instrument = self.instrument.as_ref();
            let sniffer = self.sniffer.as_ref();
            let watch_closed = self.watch_closed;

            let mut command_buf = [0u8; 1024];
            let mut data_buf = [0u8; 1024];
            let mut sniffer_buf = [0u8; 1024];
            let mut instrument_buf = vec![0u8; self.config.max_packet_size.max(1024)];

            tokio::select! {
                _ = tick.tick() => Wake::Tick,
                res = shutdown_rx.changed(), if !watch_closed => {
                    if res.is_ok() { Wake::Shutdown } else { Wake::WatchClosed }
                }
                res = accept_on(observatory.command().listener()) => Wake::ObsCommandAccept(res),
                res = read_on(observatory.command().client(), &mut command_buf) => {
                    Wake::ObsCommandRead(res.map(|n| command_buf[..n].to_vec()))
                }
                res = accept_on(observatory.data().listener()) => Wake::ObsDataAccept(res),
                res = read_on(observatory.data().client(), &mut data_buf) => {
                    Wake::ObsDataRead(res.map(|n| data_buf[..n].to_vec()))
                }
                res = instrument_read(instrument, &mut instrument_buf) => {
                    Wake::InstrumentRead(res.map(|n| instrument_buf[..n].to_vec()))
                }
                res = accept_on(sniffer.and_then(TcpServer::listener)) => Wake::SnifferAccept(res),
                res = read_on(sniffer.and_then(TcpServer::client), &mut sniffer_buf) => {
                    Wake::SnifferRead(res)
                }
            }
        };

        match wake {
            Wake::Tick => {
                if self.state == AgentState::Disconnected {
                    self.initialize_instrument().await;
                    if self.state == AgentState::Connected {
                        // Endpoints changed, rebuild the fan-out against them.
                        self.initialize_publishers();
                    }
                }
            }
            Wake::Shutdown => {
                info!("shutdown signal received");
                self.shutdown = true;
                return;
            }
            Wake::WatchClosed => {
                self.watch_closed = true;
            }
            Wake::ObsCommandAccept(res) => self.handle_command_accept(res),
            Wake::ObsCommandRead(res) => self.handle_command_read(res).await,
            Wake::ObsDataAccept(res) => self.handle_data_accept(res),
            Wake::ObsDataRead(res) => self.handle_data_read(res).await,
            Wake::InstrumentRead(res) => self.handle_instrument_read(res).await,
            Wake::SnifferAccept(res) => self.handle_sniffer_accept(res),
            Wake::SnifferRead(res) => self.handle_sniffer_read(res).await,
        }

        self.drain_quiescent().await;
        self.publish_heartbeat().await;

        if self.state == AgentState::Unconfigured && self.config.is_configured() {
            self.set_state(AgentState::Configured);
        }
    }

    //////
    // Accept handlers
    //////

    fn handle_command_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) {
        match res {
            Ok((stream, peer)) => {
                if let Err(e) = self.observatory.command_mut().attach_client(stream, peer) {
                    error!(error = %e, "observatory command accept failed");
                }
            }
            Err(e) => warn!(error = %e, "observatory command accept error"),
        }
    }

    fn handle_data_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) {
        match res {
            Ok((stream, peer)) => {
                if let Err(e) = self.observatory.data_mut().attach_client(stream, peer) {
                    error!(error = %e, "observatory data accept failed");
                }
            }
            Err(e) => warn!(error = %e, "observatory data accept error"),
        }
    }

    fn handle_sniffer_accept(&mut self, res: io::Result<(TcpStream, SocketAddr)>) {
        let Some(sniffer) = self.sniffer.as_mut() else {
            return;
        };
        match res {
            Ok((stream, peer)) => {
                if let Err(e) = sniffer.attach_client(stream, peer) {
                    error!(error = %e, "sniffer accept failed");
                }
            }
            Err(e) => warn!(error = %e, "sniffer accept error"),
        }
    }

    //////
    // Read handlers
    //////

    /// Observatory command bytes: republish as a command packet, then feed
    /// complete lines to the parser and act on the queued commands.
    async fn handle_command_read(&mut self, res: io::Result<Vec<u8>>) {
        let data = match res {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "observatory command read error");
                let _ = self.observatory.command_mut().reset_client().await;
                return;
            }
        };

        if data.is_empty() {
            let _ = self.observatory.command_mut().reset_client().await;
            return;
        }

        self.command_accum.extend_from_slice(&data);
        let complete = take_complete_lines(&mut self.command_accum);
        if !complete.is_empty() {
            let text = String::from_utf8_lossy(&complete).into_owned();
            self.config.clear_commands();
            self.config.parse(&text);
            self.process_agent_commands().await;
        }

        if let Ok(packet) = Packet::new(PacketType::PortAgentCommand, Timestamp::now(), &data) {
            self.publish_packet(&packet).await;
        }
    }

    /// Observatory data bytes become driver-data packets and flow to the
    /// instrument as raw payload.
    async fn handle_data_read(&mut self, res: io::Result<Vec<u8>>) {
        let data = match res {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "observatory data read error");
                let _ = self.observatory.data_mut().reset_client().await;
                return;
            }
        };

        if data.is_empty() {
            let _ = self.observatory.data_mut().reset_client().await;
            return;
        }

        match Packet::new(PacketType::DataFromDriver, Timestamp::now(), &data) {
            Ok(packet) => self.publish_packet(&packet).await,
            Err(e) => error!(error = %e, "driver data packet build failed"),
        }
    }

    /// Instrument bytes: reassemble (RSN) or frame (everything else), then
    /// fan the packets out.
    async fn handle_instrument_read(&mut self, res: io::Result<Vec<u8>>) {
        let data = match res {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "instrument read error");
                self.drop_instrument_connection();
                return;
            }
        };

        if data.is_empty() {
            info!("instrument connection closed");
            self.drop_instrument_connection();
            return;
        }

        trace!(count = data.len(), "instrument bytes");

        let packets = if self.config.instrument_type == InstrumentType::Rsn {
            self.reassemble_rsn(&data)
        } else {
            self.frame_bytes(&data)
        };

        for packet in packets {
            self.publish_packet(&packet).await;
        }
    }

    /// Sniffer input is ignored, but the read detects disconnects.
    async fn handle_sniffer_read(&mut self, res: io::Result<usize>) {
        let Some(sniffer) = self.sniffer.as_mut() else {
            return;
        };
        match res {
            Ok(0) | Err(_) => {
                let _ = sniffer.reset_client().await;
            }
            Ok(n) => debug!(count = n, "sniffer bytes ignored"),
        }
    }

    fn drop_instrument_connection(&mut self) {
        if let Some(instrument) = self.instrument.as_mut() {
            instrument.disconnect();
        }
        self.set_state(AgentState::Disconnected);
    }

    fn reassemble_rsn(&mut self, data: &[u8]) -> Vec<Packet> {
        let Some(buffer) = self
            .instrument
            .as_mut()
            .and_then(InstrumentConnection::rsn_buffer_mut)
        else {
            return Vec::new();
        };

        if let Err(e) = buffer.write_raw_data(data) {
            error!(error = %e, "raw packet buffer rejected chunk");
            return Vec::new();
        }

        let mut packets = Vec::new();
        loop {
            match buffer.next_packet() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "raw packet reassembly error");
                    break;
                }
            }
        }
        packets
    }

    fn frame_bytes(&mut self, data: &[u8]) -> Vec<Packet> {
        let ts = Timestamp::now();
        let Some(framer) = self.framer.as_mut() else {
            // No framer configured; forward the chunk as one packet.
            return Packet::new(PacketType::DataFromInstrument, ts, data)
                .map(|p| vec![p])
                .unwrap_or_default();
        };

        let mut packets = Vec::new();
        for &byte in data {
            match framer.push(byte, ts) {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => {}
                Err(e) => error!(error = %e, "framer error"),
            }
        }

        // Without a sentinel to wait for, a read boundary delivers the
        // remainder immediately.
        if self.config.sentinel.is_empty() {
            if let Ok(Some(packet)) = framer.flush() {
                packets.push(packet);
            }
        }

        packets
    }

    //////
    // Command processing
    //////

    async fn process_agent_commands(&mut self) {
        while let Some(command) = self.config.next_command() {
            debug!(?command, "processing agent command");
            match command {
                AgentCommand::Help => self.publish_status(HELP_TEXT).await,
                AgentCommand::CommConfigUpdate => {
                    info!("communication config update, reconfiguring");
                    self.set_state(AgentState::Unconfigured);
                }
                AgentCommand::PublisherConfigUpdate => {
                    debug!("publisher config update");
                }
                AgentCommand::PathConfigUpdate => {
                    debug!("path config update");
                }
                AgentCommand::SaveConfig => {
                    let path = self.config.conffile_path();
                    match self.config.save_file(&path) {
                        Ok(()) => {
                            let message = format!("configuration saved: {}", path.display());
                            self.publish_status(&message).await;
                        }
                        Err(e) => self.publish_fault(&e.to_string()).await,
                    }
                }
                AgentCommand::GetConfig => {
                    let dump = self.config.dump();
                    self.publish_status(&dump).await;
                }
                AgentCommand::GetState => {
                    self.publish_status(self.state.name()).await;
                }
                AgentCommand::Ping => {
                    let message = format!("pong. version: {VERSION}");
                    self.publish_status(&message).await;
                }
                AgentCommand::Break => {
                    let command = format!("break {}\n", self.config.break_duration);
                    self.publish_instrument_command(&command).await;
                }
                AgentCommand::RotationInterval => {
                    self.publishers
                        .set_rotation_interval(self.config.rotation_interval);
                }
                AgentCommand::Shutdown => {
                    info!("shutdown command received");
                    self.shutdown = true;
                }
            }
        }
    }

    //////
    // Endpoint initialization
    //////

    /// Bring the instrument composition in line with the configuration,
    /// rebuilding on type change, reconnecting on endpoint change, and
    /// settle into CONNECTED or DISCONNECTED.
    async fn initialize_instrument(&mut self) {
        let desired = self.config.instrument_type;

        if self
            .instrument
            .as_ref()
            .is_some_and(|instrument| instrument.kind() != desired)
        {
            info!("instrument connection type changed, rebuilding");
            if let Some(instrument) = self.instrument.as_mut() {
                instrument.disconnect();
            }
            self.instrument = None;
        }

        match desired {
            InstrumentType::Tcp => self.prepare_tcp_instrument(),
            InstrumentType::Rsn => self.prepare_rsn_instrument(),
            InstrumentType::Botpt => self.prepare_botpt_instrument(),
            InstrumentType::Serial => {
                self.prepare_serial_instrument();
                return;
            }
            InstrumentType::Unknown => {
                error!("instrument connection type not recognized");
                return;
            }
        }

        if self.instrument.is_none() {
            return;
        }

        if !self
            .instrument
            .as_ref()
            .is_some_and(InstrumentConnection::connected)
        {
            debug!("instrument not connected, attempting to connect");
            self.set_state(AgentState::Disconnected);

            if let Some(instrument) = self.instrument.as_mut() {
                if let Err(e) = instrument.initialize().await {
                    instrument.disconnect();
                    error!(error = %e, "instrument connect failed");
                }
            }
        }

        if self
            .instrument
            .as_ref()
            .is_some_and(InstrumentConnection::connected)
        {
            self.set_state(AgentState::Connected);
        }
    }

    fn prepare_tcp_instrument(&mut self) {
        let addr = self.config.instrument_addr.clone();
        let port = self.config.instrument_data_port;

        let instrument = self.instrument.get_or_insert_with(|| {
            InstrumentConnection::Tcp(InstrumentTcp {
                data: crate::comm::TcpClient::new(&addr, port),
            })
        });

        if let InstrumentConnection::Tcp(c) = instrument {
            if c.data.host() != addr || c.data.port() != port {
                info!("instrument endpoint changed, reconfiguring");
                c.data.disconnect();
                c.data.set_endpoint(&addr, port);
            }
        }
    }

    fn prepare_rsn_instrument(&mut self) {
        let addr = self.config.instrument_addr.clone();
        let data_port = self.config.instrument_data_port;
        let command_port = self.config.instrument_command_port;
        let max_packet = self.config.max_packet_size;

        if self.instrument.is_none() {
            match RawPacketBuffer::new(max_packet * 4, max_packet, max_packet) {
                Ok(buffer) => {
                    self.instrument = Some(InstrumentConnection::Rsn(InstrumentRsn {
                        data: crate::comm::TcpClient::new(&addr, data_port),
                        command: crate::comm::TcpClient::new(&addr, command_port),
                        buffer,
                    }));
                }
                Err(e) => {
                    error!(error = %e, "raw packet buffer construction failed");
                    return;
                }
            }
        }

        if let Some(InstrumentConnection::Rsn(c)) = self.instrument.as_mut() {
            if c.data.host() != addr
                || c.data.port() != data_port
                || c.command.host() != addr
                || c.command.port() != command_port
            {
                info!("instrument endpoint changed, reconfiguring");
                c.data.disconnect();
                c.command.disconnect();
                c.data.set_endpoint(&addr, data_port);
                c.command.set_endpoint(&addr, command_port);
            }
        }
    }

    fn prepare_botpt_instrument(&mut self) {
        let addr = self.config.instrument_addr.clone();
        let tx_port = self.config.instrument_data_tx_port;
        let rx_port = self.config.instrument_data_rx_port;

        let instrument = self.instrument.get_or_insert_with(|| {
            InstrumentConnection::Botpt(InstrumentBotpt {
                tx: crate::comm::TcpClient::new(&addr, tx_port),
                rx: crate::comm::TcpClient::new(&addr, rx_port),
            })
        });

        if let InstrumentConnection::Botpt(c) = instrument {
            if c.tx.host() != addr || c.tx.port() != tx_port || c.rx.port() != rx_port {
                info!("instrument endpoint changed, reconfiguring");
                c.tx.disconnect();
                c.rx.disconnect();
                c.tx.set_endpoint(&addr, tx_port);
                c.rx.set_endpoint(&addr, rx_port);
            }
        }
    }

    /// Serial has two dirty axes: a path change forces a reopen, a
    /// settings change only re-applies termios.
    fn prepare_serial_instrument(&mut self) {
        let instrument = self.instrument.get_or_insert_with(|| {
            InstrumentConnection::Serial(InstrumentSerial {
                device: crate::comm::SerialDevice::new(),
            })
        });

        let InstrumentConnection::Serial(c) = instrument else {
            return;
        };

        c.device.set_settings(crate::comm::SerialSettings {
            baud: self.config.baud,
            databits: self.config.databits,
            stopbits: self.config.stopbits,
            parity: self.config.parity,
            flow: self.config.flow,
        });

        if self.config.device_path_changed() || !c.device.connected() {
            info!("device path changed or closed, reopening");
            c.device.set_path(&self.config.device_path);
            match c.device.open() {
                Ok(()) => {
                    self.config.clear_device_path_changed();
                    self.config.clear_serial_settings_changed();
                }
                Err(e) => error!(error = %e, "serial open failed"),
            }
        } else if self.config.serial_settings_changed() {
            info!("serial settings changed, re-applying");
            match c.device.apply_settings() {
                Ok(()) => self.config.clear_serial_settings_changed(),
                Err(e) => error!(error = %e, "serial settings failed"),
            }
        }

        if c.device.connected() {
            self.set_state(AgentState::Connected);
        } else {
            self.set_state(AgentState::Disconnected);
        }
    }

    async fn initialize_sniffer(&mut self) {
        let port = self.config.telnet_sniffer_port;
        if port == 0 {
            self.sniffer = None;
            return;
        }

        if self
            .sniffer
            .as_ref()
            .is_some_and(|sniffer| sniffer.port() == port)
        {
            return;
        }

        let mut server = TcpServer::new(port);
        match server.initialize().await {
            Ok(()) => self.sniffer = Some(server),
            Err(e) => {
                error!(error = %e, "failed to establish telnet sniffer");
                self.sniffer = None;
            }
        }
    }

    fn initialize_publishers(&mut self) {
        debug!("initialize publishers");

        let mut log = DataLog::with_base(&self.config.datafile_base(), "data");
        log.set_rotation(self.config.rotation_interval);
        self.publishers.add(Publisher::File { log, ascii: false });

        self.publishers.add(Publisher::DriverData { ascii: false });
        self.publishers
            .add(Publisher::DriverCommand { ascii: false });
        self.publishers.add(Publisher::InstrumentData);

        if self.config.instrument_type == InstrumentType::Rsn {
            self.publishers.add(Publisher::InstrumentCommand);
        }

        if self.sniffer.is_some() {
            self.publishers.add(Publisher::TelnetSniffer {
                port: self.config.telnet_sniffer_port,
                prefix: self.config.telnet_sniffer_prefix.clone().into_bytes(),
                suffix: self.config.telnet_sniffer_suffix.clone().into_bytes(),
            });
        }
    }

    fn rebuild_framer(&mut self) {
        let sentinel = (!self.config.sentinel.is_empty()).then_some(self.config.sentinel.as_slice());
        match StreamFramer::new(
            PacketType::DataFromInstrument,
            self.config.max_packet_size,
            Some(SELECT_SLEEP_TIME.as_secs_f64()),
            sentinel,
        ) {
            Ok(framer) => self.framer = Some(framer),
            Err(e) => {
                error!(error = %e, "framer construction failed");
                self.framer = None;
            }
        }
    }

    //////
    // Publishing
    //////

    async fn publish_packet(&mut self, packet: &Packet) {
        trace!("publishing packet\n{}", packet.pretty());

        let (command, data) = self.observatory.split_mut();
        let mut ctx = SinkContext {
            observatory_command: Some(command),
            observatory_data: Some(data),
            instrument: self.instrument.as_mut(),
            sniffer: self.sniffer.as_mut(),
        };

        let failures = self.publishers.publish(packet, &mut ctx).await;
        if !failures.is_empty() {
            error!(error = %aggregate_failures(&failures), "packet publish failure");
        }
    }

    async fn publish_status(&mut self, message: &str) {
        info!(message, "port agent status");
        match Packet::new(
            PacketType::PortAgentStatus,
            Timestamp::now(),
            message.as_bytes(),
        ) {
            Ok(packet) => self.publish_packet(&packet).await,
            Err(e) => error!(error = %e, "status packet build failed"),
        }
    }

    async fn publish_fault(&mut self, message: &str) {
        error!(message, "port agent fault");
        match Packet::new(
            PacketType::PortAgentFault,
            Timestamp::now(),
            message.as_bytes(),
        ) {
            Ok(packet) => self.publish_packet(&packet).await,
            Err(e) => error!(error = %e, "fault packet build failed"),
        }
    }

    async fn publish_instrument_command(&mut self, command: &str) {
        debug!(command, "sending instrument command");
        match Packet::new(
            PacketType::InstrumentCommand,
            Timestamp::now(),
            command.as_bytes(),
        ) {
            Ok(packet) => self.publish_packet(&packet).await,
            Err(e) => error!(error = %e, "instrument command packet build failed"),
        }
    }

    /// Emit a heartbeat frame when the configured interval has elapsed.
    async fn publish_heartbeat(&mut self) {
        let interval = self.config.heartbeat_interval;
        if interval == 0 {
            return;
        }

        if self.last_heartbeat.elapsed() >= Duration::from_secs(u64::from(interval)) {
            debug!("port agent heartbeat");
            match Packet::new(PacketType::PortAgentHeartbeat, Timestamp::now(), b"") {
                Ok(packet) => self.publish_packet(&packet).await,
                Err(e) => error!(error = %e, "heartbeat packet build failed"),
            }
            self.last_heartbeat = Instant::now();
        }
    }

    /// Deliver a partial packet once the byte stream has gone quiet.
    async fn drain_quiescent(&mut self) {
        let drained = match self.framer.as_mut() {
            Some(framer) => framer.take_if_quiescent(),
            None => return,
        };

        match drained {
            Ok(Some(packet)) => self.publish_packet(&packet).await,
            Ok(None) => {}
            Err(e) => error!(error = %e, "quiescent drain failed"),
        }
    }

    fn set_state(&mut self, state: AgentState) {
        if state != self.state {
            info!(from = self.state.name(), to = state.name(), "state transition");
            self.state = state;
        }
    }
}

//////
// Multiplexer helpers; absent endpoints pend forever.
//////

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_on(stream: Option<&TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    let Some(stream) = stream else {
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

async fn instrument_read(
    instrument: Option<&InstrumentConnection>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match instrument {
        Some(instrument) => instrument.wait_read_data(buf).await,
        None => std::future::pending().await,
    }
}

/// Split off everything up to and including the last newline, leaving the
/// partial tail in place.
fn take_complete_lines(accum: &mut Vec<u8>) -> Vec<u8> {
    match accum.iter().rposition(|&b| b == b'\n') {
        Some(pos) => {
            let rest = accum.split_off(pos + 1);
            std::mem::replace(accum, rest)
        }
        None => Vec::new(),
    }
}
