#![forbid(unsafe_code)]

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use port_agent_lib::packet::{Packet, PacketType, Timestamp};
use port_agent_lib::{PortAgent, PortAgentConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn pick_free_port() -> TestResult<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Fake instrument endpoint: everything sent into the channel goes to the
/// connected agent, everything the agent writes comes back out.
async fn spawn_instrument() -> TestResult<(
    u16,
    mpsc::UnboundedSender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                msg = out_rx.recv() => match msg {
                    Some(data) => {
                        if stream.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                res = stream.read(&mut buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = in_tx.send(buf[..n].to_vec());
                    }
                },
            }
        }
    });

    Ok((port, out_tx, in_rx))
}

fn spawn_agent(commands: &str) -> (JoinHandle<()>, watch::Sender<bool>) {
    let mut config = PortAgentConfig::new();
    assert!(config.parse(commands));
    config.clear_commands();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut agent = PortAgent::new(config);
        let _ = agent.run(shutdown_rx).await;
    });
    (handle, shutdown_tx)
}

/// Read one complete port-agent frame off a stream.
async fn read_frame(stream: &mut TcpStream, accum: &mut Vec<u8>) -> TestResult<Packet> {
    loop {
        if accum.len() >= 16 {
            let size = u16::from_be_bytes([accum[4], accum[5]]) as usize;
            if size >= 16 && accum.len() >= size {
                let frame: Vec<u8> = accum.drain(..size).collect();
                return Ok(Packet::from_bytes(&frame)?);
            }
        }

        let mut tmp = [0u8; 4096];
        let n = timeout(Duration::from_secs(2), stream.read(&mut tmp)).await??;
        if n == 0 {
            return Err("connection closed while waiting for frame".into());
        }
        accum.extend_from_slice(&tmp[..n]);
    }
}

async fn read_frame_of_type(
    stream: &mut TcpStream,
    accum: &mut Vec<u8>,
    wanted: PacketType,
) -> TestResult<Packet> {
    loop {
        let packet = read_frame(stream, accum).await?;
        if packet.packet_type() == wanted {
            return Ok(packet);
        }
    }
}

#[tokio::test]
async fn tcp_instrument_end_to_end() -> TestResult<()> {
    let (instrument_port, to_instrument, mut from_instrument) = spawn_instrument().await?;
    let command_port = pick_free_port()?;
    let data_port = pick_free_port()?;
    let dir = tempfile::tempdir()?;

    let (agent, shutdown) = spawn_agent(&format!(
        "command_port {command_port}\n\
         data_port {data_port}\n\
         log_dir {}\n\
         instrument_type tcp\n\
         instrument_addr 127.0.0.1\n\
         instrument_data_port {instrument_port}\n",
        dir.path().display()
    ));

    // Let the agent configure and connect to the instrument.
    sleep(Duration::from_millis(300)).await;

    let mut data_client = TcpStream::connect(("127.0.0.1", data_port)).await?;
    sleep(Duration::from_millis(100)).await;

    // Instrument bytes come back to the driver as a framed packet.
    to_instrument.send(b"t = 21.4\r\n".to_vec())?;
    let mut accum = Vec::new();
    let packet =
        read_frame_of_type(&mut data_client, &mut accum, PacketType::DataFromInstrument).await?;
    assert_eq!(packet.payload(), b"t = 21.4\r\n");

    // Driver bytes reach the instrument as raw payload.
    data_client.write_all(b"ts\r\n").await?;
    let received = timeout(Duration::from_secs(2), from_instrument.recv())
        .await?
        .ok_or("instrument closed")?;
    assert_eq!(received, b"ts\r\n");

    // The durable record was written before network fan-out.
    shutdown.send(true)?;
    let _ = timeout(Duration::from_secs(3), agent).await;
    let logs: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".data"))
        .collect();
    assert_eq!(logs.len(), 1);
    assert!(std::fs::metadata(logs[0].path())?.len() > 0);

    Ok(())
}

#[tokio::test]
async fn command_session_drives_agent() -> TestResult<()> {
    let (instrument_port, _to_instrument, _from_instrument) = spawn_instrument().await?;
    let command_port = pick_free_port()?;
    let data_port = pick_free_port()?;
    let dir = tempfile::tempdir()?;

    let (agent, _shutdown) = spawn_agent(&format!(
        "command_port {command_port}\n\
         data_port {data_port}\n\
         log_dir {}\n\
         instrument_type tcp\n\
         instrument_addr 127.0.0.1\n\
         instrument_data_port {instrument_port}\n",
        dir.path().display()
    ));

    sleep(Duration::from_millis(300)).await;

    let mut command_client = TcpStream::connect(("127.0.0.1", command_port)).await?;
    sleep(Duration::from_millis(100)).await;
    let mut accum = Vec::new();

    command_client.write_all(b"get_state\n").await?;
    let status =
        read_frame_of_type(&mut command_client, &mut accum, PacketType::PortAgentStatus).await?;
    assert_eq!(status.payload(), b"CONNECTED");

    command_client.write_all(b"ping\n").await?;
    let pong =
        read_frame_of_type(&mut command_client, &mut accum, PacketType::PortAgentStatus).await?;
    assert!(pong.payload().starts_with(b"pong. version:"));

    command_client.write_all(b"get_config\n").await?;
    let dump =
        read_frame_of_type(&mut command_client, &mut accum, PacketType::PortAgentStatus).await?;
    let text = String::from_utf8_lossy(dump.payload()).into_owned();
    assert!(text.contains(&format!("command_port {command_port}")));
    assert!(text.contains("instrument_type tcp"));

    // A shutdown command ends the run loop cleanly.
    command_client.write_all(b"shutdown\n").await?;
    timeout(Duration::from_secs(3), agent).await??;

    Ok(())
}

#[tokio::test]
async fn rsn_instrument_reassembles_upstream_frames() -> TestResult<()> {
    let (data_port_upstream, to_instrument, _from_instrument) = spawn_instrument().await?;
    let (digi_command_port, _to_digi, mut from_digi) = spawn_instrument().await?;
    let command_port = pick_free_port()?;
    let data_port = pick_free_port()?;
    let dir = tempfile::tempdir()?;

    let (agent, shutdown) = spawn_agent(&format!(
        "command_port {command_port}\n\
         data_port {data_port}\n\
         log_dir {}\n\
         instrument_type rsn\n\
         instrument_addr 127.0.0.1\n\
         instrument_data_port {data_port_upstream}\n\
         instrument_command_port {digi_command_port}\n",
        dir.path().display()
    ));

    sleep(Duration::from_millis(300)).await;

    // On connect the agent asks the digi for binary timestamps.
    let digi_cmd = timeout(Duration::from_secs(2), from_digi.recv())
        .await?
        .ok_or("digi connection closed")?;
    assert_eq!(digi_cmd, b"time 1\n");

    let mut data_client = TcpStream::connect(("127.0.0.1", data_port)).await?;
    sleep(Duration::from_millis(100)).await;

    // Garbage then a pre-framed packet: a fault, then the clean frame.
    let framed = Packet::new(
        PacketType::DataFromInstrument,
        Timestamp::from_parts(3_650_000_000, 0),
        b"digi says hi",
    )?;
    let mut upstream = vec![0x55, 0x66];
    upstream.extend_from_slice(framed.as_bytes());
    to_instrument.send(upstream)?;

    let mut accum = Vec::new();
    let fault =
        read_frame_of_type(&mut data_client, &mut accum, PacketType::PortAgentFault).await?;
    assert_eq!(fault.payload(), &[0x55, 0x66]);

    let packet =
        read_frame_of_type(&mut data_client, &mut accum, PacketType::DataFromInstrument).await?;
    assert_eq!(packet.payload(), b"digi says hi");

    shutdown.send(true)?;
    let _ = timeout(Duration::from_secs(3), agent).await;
    Ok(())
}

#[tokio::test]
async fn heartbeat_emitted_at_interval() -> TestResult<()> {
    let (instrument_port, _to_instrument, _from_instrument) = spawn_instrument().await?;
    let command_port = pick_free_port()?;
    let data_port = pick_free_port()?;
    let dir = tempfile::tempdir()?;

    let (agent, shutdown) = spawn_agent(&format!(
        "command_port {command_port}\n\
         data_port {data_port}\n\
         log_dir {}\n\
         heartbeat_interval 1\n\
         instrument_type tcp\n\
         instrument_addr 127.0.0.1\n\
         instrument_data_port {instrument_port}\n",
        dir.path().display()
    ));

    sleep(Duration::from_millis(300)).await;

    let mut data_client = TcpStream::connect(("127.0.0.1", data_port)).await?;
    let mut accum = Vec::new();
    let heartbeat = read_frame_of_type(
        &mut data_client,
        &mut accum,
        PacketType::PortAgentHeartbeat,
    )
    .await?;
    assert_eq!(heartbeat.payload_size(), 0);

    shutdown.send(true)?;
    let _ = timeout(Duration::from_secs(3), agent).await;
    Ok(())
}
