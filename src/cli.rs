//! Command-line interface and REPL

use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use encoder_bridge::bus::{ApplicationCommand, BridgeEvent, EventBus};
use encoder_bridge::state::CHANNEL_NAMES;
use encoder_bridge::transport::PortHandle;
use encoder_bridge::EncoderBridge;

/// A parsed console command
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Set { name: String, value: f64 },
    Get(Option<String>),
    Connect(Option<String>),
    Disconnect,
    Status,
    Help,
    Quit,
}

/// Parse one console line; `Ok(None)` for blank input
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = parts.collect();

    let command = match (verb.to_lowercase().as_str(), args.as_slice()) {
        ("set", [name, value]) => {
            let value: f64 = value
                .parse()
                .map_err(|_| format!("invalid value '{}'", value))?;
            ReplCommand::Set {
                name: name.to_string(),
                value,
            }
        }
        ("set", _) => return Err("usage: set <name> <value>".into()),
        ("get", []) => ReplCommand::Get(None),
        ("get", [name]) => ReplCommand::Get(Some(name.to_string())),
        ("connect", []) => ReplCommand::Connect(None),
        ("connect", [port]) => ReplCommand::Connect(Some(port.to_string())),
        ("disconnect", []) => ReplCommand::Disconnect,
        ("status", []) => ReplCommand::Status,
        ("help" | "?", _) => ReplCommand::Help,
        ("quit" | "exit", _) => ReplCommand::Quit,
        (other, _) => return Err(format!("unknown command '{}' (try 'help')", other)),
    };

    Ok(Some(command))
}

/// Print available serial ports
pub fn list_ports_formatted(ports: &[PortHandle]) {
    println!("\n{}", "=== Available Serial Ports ===".bold().cyan());
    if ports.is_empty() {
        println!("  {}", "No serial ports found".dimmed());
        return;
    }
    for port in ports {
        match &port.description {
            Some(desc) => println!("  {} {}", port.name.green(), desc.dimmed()),
            None => println!("  {}", port.name.green()),
        }
    }
}

/// Render an event for the console
pub fn format_event(event: &BridgeEvent) -> String {
    match event {
        BridgeEvent::HardwareConnected {
            parameter_values, ..
        } => {
            let values: Vec<String> = CHANNEL_NAMES
                .iter()
                .zip(parameter_values)
                .map(|(name, v)| format!("{}={:.3}", name, v))
                .collect();
            format!("{} {}", "connected".green().bold(), values.join(" "))
        }
        BridgeEvent::HardwareDisconnected { .. } => "disconnected".yellow().bold().to_string(),
        BridgeEvent::HardwareConnectionError { message } => {
            format!("{} {}", "connection error:".red().bold(), message)
        }
        BridgeEvent::ParameterChanged {
            parameter_name,
            value,
            delta,
            ..
        } => format!(
            "{} {:<10} {:.3} ({:+.2})",
            "param".cyan(),
            parameter_name,
            value,
            delta
        ),
    }
}

/// Print bus events until the bus closes
pub fn spawn_event_printer(mut events: broadcast::Receiver<BridgeEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!(error = %e, "Failed to serialize event"),
                        }
                    } else {
                        println!("{}", format_event(&event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Interactive console
///
/// rustyline blocks, so line editing runs on its own thread and hands lines
/// to the async side over a channel.
pub async fn run_repl(bridge: EncoderBridge, bus: EventBus) -> Result<()> {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(8);

    std::thread::Builder::new()
        .name("repl".into())
        .spawn(move || {
            let mut rl = match DefaultEditor::new() {
                Ok(rl) => rl,
                Err(e) => {
                    warn!(error = %e, "Console unavailable");
                    let _ = line_tx.blocking_send("quit".into());
                    return;
                }
            };
            loop {
                match rl.readline("encoder> ") {
                    Ok(line) => {
                        let _ = rl.add_history_entry(line.as_str());
                        if line_tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                        let _ = line_tx.blocking_send("quit".into());
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Console read failed");
                        let _ = line_tx.blocking_send("quit".into());
                        break;
                    }
                }
            }
        })?;

    print_help();

    while let Some(line) = line_rx.recv().await {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg.red());
                continue;
            }
        };

        debug!(?command, "Console command");

        match command {
            ReplCommand::Quit => break,
            ReplCommand::Help => print_help(),
            ReplCommand::Set { name, value } => {
                if CHANNEL_NAMES.iter().all(|n| !n.eq_ignore_ascii_case(&name)) {
                    println!("{} unknown parameter '{}'", "error:".red(), name);
                    continue;
                }
                let delivered = bus.send_command(ApplicationCommand::ApplicationParameterChanged {
                    parameter_name: name,
                    value,
                });
                if !delivered {
                    println!("{} bridge is not listening", "error:".red());
                }
            }
            ReplCommand::Get(Some(name)) => match bridge.get(&name).await {
                Some(value) => println!("{} = {:.3}", name, value),
                None => println!("{} unknown parameter '{}'", "error:".red(), name),
            },
            ReplCommand::Get(None) => {
                if let Some(values) = bridge.values().await {
                    for (name, value) in CHANNEL_NAMES.iter().zip(values) {
                        println!("  {:<10} {:.3}", name, value);
                    }
                }
            }
            ReplCommand::Connect(port) => {
                let result = match port {
                    Some(port) => bridge.connect_to(&port).await,
                    None => bridge.connect().await,
                };
                if let Err(e) = result {
                    println!("{} {}", "connect failed:".red(), e);
                }
            }
            ReplCommand::Disconnect => {
                if !bridge.disconnect().await {
                    println!("{}", "not connected".dimmed());
                }
            }
            ReplCommand::Status => print_status(&bridge).await,
        }
    }

    Ok(())
}

async fn print_status(bridge: &EncoderBridge) {
    let status = bridge.status().await;

    let port = status
        .port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".into());
    println!("{} {} on {}", "link:".bold(), status.connection, port);
    if status.reconnect_pending {
        println!("  reconnect pending");
    }
    if status.reconnect_suppressed {
        println!("  auto-reconnect suppressed (user disconnect)");
    }
    for ch in &status.channels {
        println!(
            "  {:<10} {:.3}  delta {:>5}  updated {}",
            ch.id.name(),
            ch.value,
            ch.cumulative_delta,
            ch.last_update_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "never".into())
        );
    }
    println!(
        "  leds: {} sent, {} coalesced, {} suppressed",
        status.feedback.sent, status.feedback.coalesced, status.feedback.suppressed
    );
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  set <name> <value>   set a parameter (volume, brightness, detune, reverb)");
    println!("  get [name]           show one or all parameter values");
    println!("  connect [port]       connect to the authorized device or a named port");
    println!("  disconnect           disconnect and stay disconnected");
    println!("  status               link and channel state");
    println!("  quit                 exit");
}
