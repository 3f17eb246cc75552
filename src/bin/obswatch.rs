use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use obswatch::bus::PropertyState;
use obswatch::config::{MountPolicy, ShutdownStep, ShutdownTrigger};
use obswatch::protocol::{Command, CommandResponse, CommandType, ResponseStatus, StatusReport};
use obswatch::ShutdownStage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7625";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

struct Target<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
    verbose: bool,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("obswatch")
        .version("0.1.0")
        .about("Observatory watchdog operator client")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Watchdog daemon host")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Watchdog control port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Test connection to the watchdog"))
        .subcommand(SubCommand::with_name("status").about("Show shutdown stage, triggers and properties"))
        .subcommand(SubCommand::with_name("connect").about("Activate the watchdog"))
        .subcommand(SubCommand::with_name("disconnect").about("Deactivate the watchdog and cancel timers"))
        .subcommand(
            SubCommand::with_name("heartbeat")
                .about("Send a client heartbeat")
                .long_about("Writes the heartbeat threshold. Each write restarts the client countdown; 0 disables it.")
                .arg(seconds_arg())
                .arg(
                    Arg::with_name("every")
                        .long("every")
                        .value_name("SECONDS")
                        .help("Keep sending heartbeats at this interval until interrupted")
                        .takes_value(true)
                        .validator(validate_seconds),
                ),
        )
        .subcommand(
            SubCommand::with_name("weather-threshold")
                .about("Set the weather grace period in seconds")
                .arg(seconds_arg()),
        )
        .subcommand(
            SubCommand::with_name("steps")
                .about("Select shutdown steps (none clears the selection)")
                .arg(
                    Arg::with_name("step")
                        .multiple(true)
                        .possible_values(&["mount", "dome", "script"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("triggers")
                .about("Select shutdown triggers (none clears the selection)")
                .arg(
                    Arg::with_name("trigger")
                        .multiple(true)
                        .possible_values(&["client", "weather"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("policy")
                .about("Set whether the dome waits for the mount")
                .arg(
                    Arg::with_name("policy")
                        .required(true)
                        .possible_values(&["ignored", "locks"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("devices")
                .about("Set peer device names")
                .arg(Arg::with_name("telescope").long("telescope").takes_value(true))
                .arg(Arg::with_name("dome").long("dome").takes_value(true))
                .arg(Arg::with_name("weather").long("weather").takes_value(true)),
        )
        .subcommand(
            SubCommand::with_name("script")
                .about("Set the shutdown script path (empty clears it)")
                .arg(Arg::with_name("path").required(true)),
        )
        .subcommand(
            SubCommand::with_name("server")
                .about("Set the property server address")
                .arg(Arg::with_name("server-host").required(true))
                .arg(
                    Arg::with_name("server-port")
                        .required(true)
                        .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be 1-65535".to_string())),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("Follow status broadcasts"))
        .get_matches();

    let target = Target {
        host: matches.value_of("host").unwrap_or(DEFAULT_HOST),
        port: matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?,
        format: matches.value_of("format").unwrap_or("table"),
        verbose: matches.is_present("verbose"),
    };

    if target.verbose {
        println!("{}", "Observatory Watchdog".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), target.host, target.port);
    }

    match matches.subcommand() {
        ("ping", _) => {
            let response = send_command(&target, CommandType::Ping).await?;
            print_command_result("Ping", "pong", &response, target.format);
        }
        ("status", _) => handle_status(&target).await?,
        ("connect", _) => {
            let response = send_command(&target, CommandType::Connect).await?;
            print_command_result("Watchdog", "connected", &response, target.format);
        }
        ("disconnect", _) => {
            let response = send_command(&target, CommandType::Disconnect).await?;
            print_command_result("Watchdog", "disconnected", &response, target.format);
        }
        ("heartbeat", Some(sub)) => handle_heartbeat(&target, sub).await?,
        ("weather-threshold", Some(sub)) => {
            let seconds = parse_seconds(sub)?;
            let response = send_command(&target, CommandType::SetWeatherThreshold { seconds }).await?;
            print_command_result("Weather threshold", &format!("{seconds}s"), &response, target.format);
        }
        ("steps", Some(sub)) => {
            let steps: Vec<ShutdownStep> = sub
                .values_of("step")
                .map(|values| values.filter_map(parse_step).collect())
                .unwrap_or_default();
            let label = describe(&steps);
            let response = send_command(&target, CommandType::SetShutdownSteps { steps }).await?;
            print_command_result("Shutdown steps", &label, &response, target.format);
        }
        ("triggers", Some(sub)) => {
            let triggers: Vec<ShutdownTrigger> = sub
                .values_of("trigger")
                .map(|values| values.filter_map(parse_trigger).collect())
                .unwrap_or_default();
            let label = describe(&triggers);
            let response = send_command(&target, CommandType::SetShutdownTriggers { triggers }).await?;
            print_command_result("Shutdown triggers", &label, &response, target.format);
        }
        ("policy", Some(sub)) => {
            let policy = match sub.value_of("policy") {
                Some("locks") => MountPolicy::Locks,
                _ => MountPolicy::Ignored,
            };
            let response = send_command(&target, CommandType::SetMountPolicy { policy }).await?;
            print_command_result("Mount policy", &format!("{policy:?}"), &response, target.format);
        }
        ("devices", Some(sub)) => {
            let command = CommandType::SetActiveDevices {
                telescope: sub.value_of("telescope").map(ToString::to_string),
                dome: sub.value_of("dome").map(ToString::to_string),
                weather: sub.value_of("weather").map(ToString::to_string),
            };
            let response = send_command(&target, command).await?;
            print_command_result("Active devices", "updated", &response, target.format);
        }
        ("script", Some(sub)) => {
            let path = sub.value_of("path").unwrap_or_default().to_string();
            let label = if path.is_empty() { "(none)".to_string() } else { path.clone() };
            let response = send_command(&target, CommandType::SetScriptPath { path }).await?;
            print_command_result("Script path", &label, &response, target.format);
        }
        ("server", Some(sub)) => {
            let host = sub.value_of("server-host").unwrap_or_default().to_string();
            let port = sub.value_of("server-port").unwrap_or_default().parse::<u16>()?;
            let label = format!("{host}:{port}");
            let response = send_command(&target, CommandType::SetServer { host, port }).await?;
            print_command_result("Property server", &label, &response, target.format);
        }
        ("monitor", _) => monitor_status(&target).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Activate the watchdog", "obswatch connect".bright_cyan());
            println!("  {} Keep the client alive", "obswatch heartbeat 60 --every 20".bright_cyan());
            println!("  {} Follow shutdown progress", "obswatch monitor".bright_cyan());
        }
    }

    Ok(())
}

fn seconds_arg() -> Arg<'static, 'static> {
    Arg::with_name("seconds")
        .required(true)
        .validator(validate_seconds)
}

#[allow(clippy::needless_pass_by_value)]
fn validate_seconds(v: String) -> Result<(), String> {
    v.parse::<u32>()
        .map(|_| ())
        .map_err(|_| "Seconds must be a non-negative integer".to_string())
}

fn parse_seconds(matches: &ArgMatches<'_>) -> CliResult<u32> {
    Ok(matches.value_of("seconds").unwrap_or("0").parse::<u32>()?)
}

fn parse_step(value: &str) -> Option<ShutdownStep> {
    match value {
        "mount" => Some(ShutdownStep::ParkMount),
        "dome" => Some(ShutdownStep::ParkDome),
        "script" => Some(ShutdownStep::RunScript),
        _ => None,
    }
}

fn parse_trigger(value: &str) -> Option<ShutdownTrigger> {
    match value {
        "client" => Some(ShutdownTrigger::ClientHeartbeat),
        "weather" => Some(ShutdownTrigger::Weather),
        _ => None,
    }
}

fn describe<T: std::fmt::Debug>(items: &[T]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().map(|i| format!("{i:?}")).collect::<Vec<_>>().join(", ")
    }
}

async fn handle_heartbeat(target: &Target<'_>, matches: &ArgMatches<'_>) -> CliResult<()> {
    let seconds = parse_seconds(matches)?;
    let every = matches
        .value_of("every")
        .map(str::parse::<u64>)
        .transpose()?
        .filter(|every| *every > 0);

    let Some(every) = every else {
        let response = send_command(target, CommandType::Heartbeat { interval_seconds: seconds }).await?;
        print_command_result("Heart beat", &format!("{seconds}s"), &response, target.format);
        return Ok(());
    };

    if every >= u64::from(seconds) && seconds > 0 {
        println!(
            "{} Sending every {}s with a {}s threshold will trip the watchdog",
            "⚠️".yellow(),
            every,
            seconds
        );
    }

    let mut interval = tokio::time::interval(Duration::from_secs(every));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let response = send_command(target, CommandType::Heartbeat { interval_seconds: seconds }).await?;
                print_command_result("Heart beat", &format!("{seconds}s"), &response, target.format);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn handle_status(target: &Target<'_>) -> CliResult<()> {
    let response = send_command(target, CommandType::Status).await?;
    if response.status != ResponseStatus::Success {
        println!("{} {}", "❌".red(), "Status check failed".bright_red());
        return Ok(());
    }

    let body = response.message.unwrap_or_default();
    match target.format {
        "json" => println!("{body}"),
        format => {
            let report: StatusReport = serde_json::from_str(&body)?;
            if format == "compact" {
                print_compact(&report);
            } else {
                print_status_table(&report);
            }
        }
    }
    Ok(())
}

fn stage_label(stage: ShutdownStage) -> ColoredString {
    let text = stage.to_string().to_uppercase();
    match stage {
        ShutdownStage::Idle => text.bright_green(),
        ShutdownStage::Complete => text.bright_cyan(),
        ShutdownStage::Error => text.bright_red(),
        _ => text.bright_yellow(),
    }
}

fn state_label(state: PropertyState) -> ColoredString {
    match state {
        PropertyState::Idle => "IDLE".dimmed(),
        PropertyState::Ok => "OK".bright_green(),
        PropertyState::Busy => "BUSY".bright_yellow(),
        PropertyState::Alert => "ALERT".bright_red(),
    }
}

fn remaining(ms: Option<u64>) -> String {
    ms.map_or_else(|| "-".to_string(), |ms| format!("{:.1}s", ms as f64 / 1000.0))
}

fn print_status_table(report: &StatusReport) {
    println!("\n{}", "🔭 Observatory Watchdog".bright_blue().bold());
    println!("{}", "═══════════════════════".bright_blue());
    println!(
        "{} {}",
        "Watchdog:".bright_white(),
        if report.connected { "CONNECTED".bright_green() } else { "DISCONNECTED".dimmed() }
    );
    println!(
        "{} {}",
        "Property bus:".bright_white(),
        if report.bus_connected { "UP".bright_green() } else { "DOWN".yellow() }
    );
    println!("{} {}", "Shutdown:".bright_white(), stage_label(report.stage));
    if let Some(cause) = report.cause {
        println!("{} {}", "Cause:".bright_white(), cause.to_string().bright_yellow());
    }
    println!("{} {:?}", "Weather:".bright_white(), report.weather);
    println!("{} {}", "Heartbeat in:".bright_white(), remaining(report.heartbeat_remaining_ms));
    println!("{} {}", "Weather grace:".bright_white(), remaining(report.weather_grace_remaining_ms));
    if let Some(code) = report.last_exit_code {
        println!("{} {}", "Script exit:".bright_white(), code);
    }
    if report.reissued_parks > 0 {
        println!("{} {}", "Re-issued parks:".bright_white(), report.reissued_parks.to_string().bright_yellow());
    }

    println!("\n{}", "Properties".bright_white().bold());
    for property in &report.properties {
        println!(
            "  {:<18} {:<6} {}",
            property.name.label(),
            state_label(property.state),
            property.message.dimmed()
        );
    }

    if !report.history.is_empty() {
        println!("\n{}", "Recent shutdowns".bright_white().bold());
        for record in report.history.iter().rev() {
            let outcome = match &record.outcome {
                Some(obswatch::shutdown::AttemptOutcome::Complete) => "complete".bright_green(),
                Some(obswatch::shutdown::AttemptOutcome::Error { .. }) => "error".bright_red(),
                None => "running".bright_yellow(),
            };
            println!("  [{:>8}] {:<15} {}", record.started_ms / 1000, record.cause.to_string(), outcome);
        }
    }
}

fn print_compact(report: &StatusReport) {
    println!(
        "[{}] {} | weather {:?} | hb {} | grace {}",
        report.timestamp_ms / 1000,
        stage_label(report.stage),
        report.weather,
        remaining(report.heartbeat_remaining_ms),
        remaining(report.weather_grace_remaining_ms)
    );
}

fn print_command_result(action: &str, value: &str, response: &CommandResponse, format: &str) {
    match format {
        "json" => println!("{}", serde_json::to_string(response).unwrap_or_default()),
        "compact" => match response.status {
            ResponseStatus::Success => println!("{}", "OK".bright_green()),
            _ => println!("{}", "FAIL".bright_red()),
        },
        _ => {
            let message = response.message.as_deref().unwrap_or("");
            match response.status {
                ResponseStatus::Success => {
                    println!("{} {} set to {}", "✅".green(), action.bright_white(), value.bright_cyan());
                }
                ResponseStatus::Rejected => {
                    println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
                    if message.contains("heart beat timeout") {
                        println!("{} Try: {}", "💡".yellow(), "obswatch heartbeat <SECONDS>".bright_cyan());
                    } else if message.contains("script file") {
                        println!("{} Try: {}", "💡".yellow(), "obswatch script <PATH>".bright_cyan());
                    } else if message.contains("in progress") {
                        println!("{} Wait for the shutdown procedure to finish", "💡".yellow());
                    }
                }
                ResponseStatus::Error => {
                    println!("{} {} failed: {}", "⚠️".yellow(), action.bright_white(), message.bright_red());
                }
            }
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn connect(target: &Target<'_>) -> CliResult<TcpStream> {
    let addr = format!("{}:{}", target.host, target.port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to watchdog at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Daemon is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "obswatchd --config /etc/obswatch.toml".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn send_command(target: &Target<'_>, command_type: CommandType) -> CliResult<CommandResponse> {
    let timestamp = current_timestamp();
    let id = (timestamp as u32).max(1);
    let command = Command {
        id,
        timestamp,
        command_type,
    };
    let json = serde_json::to_string(&command)?;
    if target.verbose {
        println!("{} {}", "→".dimmed(), json.dimmed());
    }

    let stream = connect(target).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let exchange = async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        // Status broadcasts share the connection; skip until our response.
        while let Some(line) = lines.next_line().await? {
            if let Ok(response) = serde_json::from_str::<CommandResponse>(&line) {
                if response.id == id || response.id == 0 {
                    return Ok(response);
                }
            }
        }
        Err::<CommandResponse, std::io::Error>(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Daemon closed connection",
        ))
    };

    match tokio::time::timeout(RESPONSE_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "⏰".yellow(), RESPONSE_TIMEOUT.as_secs());
            eprintln!("{} A shutdown script may be holding the daemon", "💡".yellow());
            Err("Command timeout".into())
        }
    }
}

async fn monitor_status(target: &Target<'_>) -> CliResult<()> {
    let stream = connect(target).await?;
    let mut lines = BufReader::new(stream).lines();
    println!("{}", "Following watchdog status (Ctrl+C to stop)".dimmed());

    while let Some(line) = lines.next_line().await? {
        match target.format {
            "json" => println!("{line}"),
            "compact" => {
                if let Ok(report) = serde_json::from_str::<StatusReport>(&line) {
                    print_compact(&report);
                }
            }
            _ => {
                if let Ok(report) = serde_json::from_str::<StatusReport>(&line) {
                    print_status_table(&report);
                }
            }
        }
    }
    Ok(())
}
