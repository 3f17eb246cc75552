use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{App, Arg};
use obswatch::bus::PropertyBus;
use obswatch::link::PeerLink;
use obswatch::protocol::{CommandType, ProtocolHandler, ResponseStatus};
use obswatch::{Watchdog, WatchdogConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:7625";
const STATUS_BROADCAST_BUFFER_SIZE: usize = 64;

type SharedWatchdog = Arc<Mutex<Watchdog<PeerLink>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obswatchd")
        .version("0.1.0")
        .about("Observatory watchdog daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Operator control address")
                .takes_value(true)
                .default_value(DEFAULT_LISTEN),
        )
        .arg(
            Arg::with_name("standby")
                .long("standby")
                .help("Start disconnected; wait for an operator Connect"),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match matches.value_of("config") {
        Some(path) => WatchdogConfig::load(Path::new(path))?,
        None => WatchdogConfig::default(),
    };
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let listen = matches.value_of("listen").unwrap_or(DEFAULT_LISTEN).to_string();

    // Snooped peer updates travel over the same link used for park commands.
    let (mut link, mut peer_events) = PeerLink::channel();
    link.connect(&config.server)?;

    let start = Instant::now();
    let now_ms = move || start.elapsed().as_millis() as u64;

    let watchdog: SharedWatchdog = Arc::new(Mutex::new(Watchdog::new(config, link)));
    if !matches.is_present("standby") {
        watchdog.lock().await.connect(now_ms())?;
    }

    let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_BUFFER_SIZE);

    let server_watchdog = Arc::clone(&watchdog);
    let server_status_tx = status_tx.clone();
    let control_server = tokio::spawn(async move {
        if let Err(e) = start_control_server(&listen, server_watchdog, server_status_tx, now_ms).await {
            error!("Control server error: {}", e);
        }
    });

    let pump_watchdog = Arc::clone(&watchdog);
    let event_pump = tokio::spawn(async move {
        while let Some(event) = peer_events.recv().await {
            pump_watchdog.lock().await.handle_peer_event(event, now_ms());
        }
    });

    let handler = ProtocolHandler::new();
    let mut interval = time::interval(poll_interval);
    // A long script step must not be followed by a burst of catch-up ticks.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = {
                    let mut guard = watchdog.lock().await;
                    // The script step blocks until the child exits.
                    tokio::task::block_in_place(|| guard.update(now_ms()))
                };
                if let Some(report) = report {
                    info!("Shutdown stage: {}", report.stage);
                    match handler.serialize_status(&report) {
                        Ok(json) => {
                            let _ = status_tx.send(json);
                        }
                        Err(e) => warn!("Failed to serialize status: {}", e),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping");
                break;
            }
        }
    }

    watchdog.lock().await.disconnect();
    control_server.abort();
    event_pump.abort();
    Ok(())
}

async fn start_control_server<F>(
    listen: &str,
    watchdog: SharedWatchdog,
    status_tx: broadcast::Sender<String>,
    now_ms: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Fn() -> u64 + Copy + Send + 'static,
{
    let listener = TcpListener::bind(listen).await?;
    info!("Control server listening on {}", listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Operator connected: {}", addr);
                let client_watchdog = Arc::clone(&watchdog);
                let client_status_rx = status_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_watchdog, client_status_rx, now_ms).await {
                        warn!("Operator {} error: {}", addr, e);
                    }
                    info!("Operator {} disconnected", addr);
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn handle_client<F>(
    stream: TcpStream,
    watchdog: SharedWatchdog,
    mut status_rx: broadcast::Receiver<String>,
    now_ms: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Fn() -> u64,
{
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));
    let handler = ProtocolHandler::new();

    let status_writer = Arc::clone(&writer);
    let status_task = tokio::spawn(async move {
        while let Ok(status) = status_rx.recv().await {
            let mut writer_guard = status_writer.lock().await;
            if writer_guard.write_all(status.as_bytes()).await.is_err()
                || writer_guard.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        if buf_reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match handler.parse_command(trimmed) {
            Ok(command) => {
                info!("Received command {}: {:?}", command.id, command.command_type);
                let reconnect = matches!(command.command_type, CommandType::SetServer { .. });
                let mut guard = watchdog.lock().await;
                let response = guard.handle_command(command, now_ms());
                if reconnect && response.status == ResponseStatus::Success {
                    let server = guard.config().server.clone();
                    if let Err(e) = guard.bus_mut().connect(&server) {
                        warn!("Unable to reconnect to {}: {}", server.address(), e);
                    }
                }
                response
            }
            Err(e) => {
                warn!("Failed to parse command: {}", e);
                handler.create_error_response(0, &format!("Invalid command format: {e}"))
            }
        };

        let json = handler.serialize_response(&response)?;
        let mut writer_guard = writer.lock().await;
        writer_guard.write_all(json.as_bytes()).await?;
        writer_guard.write_all(b"\n").await?;
    }

    status_task.abort();
    Ok(())
}
