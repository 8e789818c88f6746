//! Interactive sensor relay shell.
//!
//! Reads `#`-delimited commands from standard input, one per line, and
//! drives a [`Relay`]:
//!
//! ```text
//! add#tool=Eclipse#sensorDataType=DevEvent#DevEvent-Type=Compile
//! statechange#1347#resource=src/lib.rs#sensorDataType=DevEvent
//! send
//! ping
//! autosend#0.5
//! help
//! quit
//! ```
//!
//! Configuration is read from the properties file given as the first
//! argument, or from `~/.hackystat/sensorshell/sensorshell.properties`.
//! Exits 0 on a clean `quit`, non-zero when configuration fails.

use std::io::Write as _;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;
use tracing_subscriber::EnvFilter;

use sensor_relay::{Relay, ShellConfig};

/// One parsed input line.
#[derive(Debug, PartialEq)]
enum Command {
    Empty,
    Quit,
    Help,
    Send,
    Ping,
    Add(Vec<(String, String)>),
    StateChange(i64, Vec<(String, String)>),
    AutoSend(f64),
    /// Syntactically broken input, with a message for the user.
    Invalid(String),
    Unknown,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            error!("{}", message);
            eprintln!("{}", message);
            std::process::exit(1);
        }
    };
    let host = config.host.clone();
    let user = config.user.clone();

    let relay = match Relay::start(config, "interactive").await {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "Can't start the relay");
            eprintln!("Can't start the relay: {}", e);
            std::process::exit(1);
        }
    };

    println!("Connected to {} as {}.", host, user);
    println!("Type 'help' for a list of commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!(">> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => "quit".to_string(),
        };

        match parse_command(&line) {
            Command::Empty => {}
            Command::Help => print_help(),
            Command::Ping => {
                let reachable = relay.ping().await;
                println!(
                    "Ping of host {} for user {} {}.",
                    host,
                    user,
                    if reachable { "succeeded" } else { "did not succeed" }
                );
            }
            Command::Send => match relay.send().await {
                Ok(count) => println!("{} records acknowledged.", count),
                Err(e) => println!("Error: {}", e),
            },
            Command::Add(pairs) => {
                if let Err(e) = relay.add_key_vals(&pairs).await {
                    println!("Error: {}", e);
                }
            }
            Command::StateChange(checksum, pairs) => {
                match relay.statechange(checksum, &pairs).await {
                    Ok(true) => println!("State changed, record queued."),
                    Ok(false) => println!("State unchanged."),
                    Err(e) => println!("Error: {}", e),
                }
            }
            Command::AutoSend(minutes) => {
                relay.set_autosend_interval(minutes);
                if minutes >= sensor_relay::shell::MIN_AUTOSEND_MINUTES {
                    println!("AutoSend set to {} minutes.", minutes);
                } else {
                    println!("AutoSend disabled.");
                }
            }
            Command::Invalid(message) => println!("Error: {}", message),
            Command::Unknown => {
                println!("Invalid command entered and ignored. Type 'help' for help.")
            }
            Command::Quit => {
                if let Err(e) = relay.quit().await {
                    println!("Quit completed with an error: {}", e);
                }
                println!("Quitting.");
                break;
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

/// Configuration comes from argv[1] or the conventional location.
fn load_config() -> Result<ShellConfig, String> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ShellConfig::default_properties_path);
    ShellConfig::from_properties_file(&path).map_err(|e| e.to_string())
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    match line {
        "quit" => return Command::Quit,
        "help" => return Command::Help,
        "send" => return Command::Send,
        "ping" => return Command::Ping,
        _ => {}
    }

    let mut tokens = line.split('#');
    let name = tokens.next().unwrap_or_default();
    let args: Vec<&str> = tokens.collect();

    match name {
        "add" => match parse_pairs(&args) {
            Ok(pairs) => Command::Add(pairs),
            Err(message) => Command::Invalid(message),
        },
        "statechange" => {
            let Some((checksum_text, rest)) = args.split_first() else {
                return Command::Invalid("statechange requires a checksum".to_string());
            };
            let Ok(checksum) = checksum_text.parse::<i64>() else {
                return Command::Invalid(format!(
                    "can't parse checksum '{}' as an integer",
                    checksum_text
                ));
            };
            match parse_pairs(rest) {
                Ok(pairs) => Command::StateChange(checksum, pairs),
                Err(message) => Command::Invalid(message),
            }
        }
        "autosend" => {
            let minutes = args.first().and_then(|text| text.parse::<f64>().ok());
            match minutes {
                Some(minutes) if minutes >= 0.0 => Command::AutoSend(minutes),
                _ => Command::Invalid(format!(
                    "autosend requires a non-negative number of minutes, got '{}'",
                    args.first().unwrap_or(&"")
                )),
            }
        }
        _ => Command::Unknown,
    }
}

fn parse_pairs(args: &[&str]) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::with_capacity(args.len());
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(format!("can't parse argument '{}' as key=value", arg));
        };
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

fn print_help() {
    println!(
        "Command summary:\n\
         \x20 add#<key>=<value>[#<key>=<value>]...\n\
         \x20   Queue a sensor data record. The timestamp, runtime, owner,\n\
         \x20   tool, sensorDataType and resource keys become record fields;\n\
         \x20   everything else becomes a property.\n\
         \x20 send\n\
         \x20   Transmit queued records now; stores them offline if the\n\
         \x20   server does not respond.\n\
         \x20 ping\n\
         \x20   Check the server and the configured credentials.\n\
         \x20 statechange#<checksum>[#<key>=<value>]...\n\
         \x20   Queue an add only when the resource/checksum pair differs\n\
         \x20   from the previous statechange.\n\
         \x20 autosend#<minutes>\n\
         \x20   Change the automatic flush period; 0 disables it.\n\
         \x20 quit\n\
         \x20   Transmit remaining records and exit."
    );
}
