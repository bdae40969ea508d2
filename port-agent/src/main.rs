#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use port_agent_lib::error::AgentError;
use port_agent_lib::{PortAgent, PortAgentConfig, SELECT_SLEEP_TIME};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Port agent between an instrument and observatory drivers")]
struct Cli {
    /// Observatory command port; the agent's unique identity
    #[arg(short = 'p', long = "command_port", value_name = "PORT")]
    command_port: Option<u16>,

    /// Configuration file: a sequence of control-port commands
    #[arg(short = 'c', long, value_name = "FILE")]
    conffile: Option<PathBuf>,

    /// Kill the agent bound to the command port and exit
    #[arg(short, long)]
    kill: bool,

    /// Run in the foreground (the only supported mode)
    #[arg(short, long)]
    single: bool,

    /// Increase diagnostic verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Parent process id; shut down when that process exits
    #[arg(short = 'y', long, value_name = "PID")]
    ppid: Option<i32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = PortAgentConfig::new();
    if let Some(path) = &cli.conffile {
        match config.load_file(path) {
            Ok(true) => {}
            Ok(false) => warn!(path = %path.display(), "configuration file had invalid lines"),
            Err(e) => {
                error!(error = %e, "failed to read configuration file");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(port) = cli.command_port {
        config.observatory_command_port = port;
    }

    if config.observatory_command_port == 0 {
        error!("observatory command port is required (--command_port or conffile)");
        return ExitCode::FAILURE;
    }

    // Startup config replays queue the same update commands a live session
    // would; the state machine starts from scratch, so drop them.
    config.clear_commands();

    let pid_path = config.pidfile_path();
    if cli.kill {
        return kill_existing(&pid_path);
    }

    if let Err(e) = prepare_directories(&config) {
        error!(error = %e, "failed to create working directories");
        return ExitCode::FAILURE;
    }

    if let Err(e) = claim_pid_file(&pid_path) {
        error!(error = %e, "startup refused");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            let _ = fs::remove_file(&pid_path);
            return ExitCode::FAILURE;
        }
    };

    let ppid = cli.ppid;
    let code = runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_supervisor(shutdown_tx, ppid);

        let mut agent = PortAgent::new(config);
        match agent.run(shutdown_rx).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "port agent exited with error");
                ExitCode::FAILURE
            }
        }
    });

    let _ = fs::remove_file(&pid_path);
    code
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Watch for termination signals and the parent poison pill, and latch the
/// shutdown flag for the agent loop.
fn spawn_supervisor(shutdown_tx: watch::Sender<bool>, ppid: Option<i32>) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => Some(term),
            Err(e) => {
                warn!(error = %e, "could not install SIGTERM handler");
                None
            }
        };
        let mut tick = interval(SELECT_SLEEP_TIME);

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        info!("interrupt received");
                    }
                    break;
                }
                _ = recv_term(term.as_mut()) => {
                    info!("terminate received");
                    break;
                }
                _ = tick.tick() => {
                    if let Some(parent) = ppid {
                        if kill(Pid::from_raw(parent), None).is_err() {
                            warn!(ppid = parent, "parent process gone, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
    });
}

async fn recv_term(term: Option<&mut tokio::signal::unix::Signal>) -> Option<()> {
    match term {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

fn prepare_directories(config: &PortAgentConfig) -> std::io::Result<()> {
    fs::create_dir_all(&config.log_dir)?;
    fs::create_dir_all(&config.pid_dir)?;
    fs::create_dir_all(&config.conf_dir)?;
    fs::create_dir_all(&config.data_dir)?;
    Ok(())
}

/// Claim the PID file, refusing to start when another live instance holds
/// the same command port.
fn claim_pid_file(path: &Path) -> Result<(), AgentError> {
    if let Ok(text) = fs::read_to_string(path) {
        match text.trim().parse::<i32>() {
            Ok(pid) if kill(Pid::from_raw(pid), None).is_ok() => {
                return Err(AgentError::DuplicateProcess(pid as u32));
            }
            Ok(pid) => {
                info!(pid, "removing stale pid file");
            }
            Err(_) => {
                warn!(path = %path.display(), "pid file unreadable, replacing");
            }
        }
    }

    fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|e| AgentError::MissingPid(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// `--kill`: signal the instance recorded in the PID file.
fn kill_existing(path: &Path) -> ExitCode {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %AgentError::MissingPid(format!("{}: {e}", path.display())), "kill failed");
            return ExitCode::FAILURE;
        }
    };

    let pid = match text.trim().parse::<i32>() {
        Ok(pid) => pid,
        Err(_) => {
            error!(error = %AgentError::MissingPid(path.display().to_string()), "kill failed");
            return ExitCode::FAILURE;
        }
    };

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => {
            info!(pid, "terminate sent");
            let _ = fs::remove_file(path);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(pid, error = %e, "kill failed");
            ExitCode::FAILURE
        }
    }
}
