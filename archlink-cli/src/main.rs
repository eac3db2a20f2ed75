//! # archlink CLI
//!
//! Operator tool for the archlink command/control channel.
//!
//! Usage:
//!   archlink validate <file|->
//!   archlink send '<json>'
//!   archlink watch
//!   archlink config
//!
//! Examples:
//!   archlink validate message.json
//!   archlink --uri ws://engine:8080/unity send '{"category":"architect","type":"request","message":"hi","metadata":{}}'
//!   archlink -vv --config archlink.toml watch

use archlink_channel::{Channel, ChannelConfig, ChannelEvent, Message, Validator};
use clap::{ArgAction, Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "archlink")]
#[command(author, version, about = "archlink - command/control channel to an environment host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host endpoint (overrides config and ARCHLINK_URI)
    #[arg(long, global = true)]
    uri: Option<String>,

    /// Credential (overrides config and ARCHLINK_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a message file ("-" for stdin) against the wire schema
    Validate {
        #[arg(required = true)]
        file: String,

        /// Reject unknown categories
        #[arg(long)]
        strict: bool,
    },
    /// Connect, send one command, print the reply, disconnect
    Send {
        /// Command as a JSON object
        #[arg(required = true)]
        json: String,

        /// Seconds to wait for the reply (default: configured response timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Connect and print channel events until Ctrl-C
    Watch,
    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

/// Defaults, then file, then environment, then flags
fn load_config(cli: &Cli) -> ChannelConfig {
    let config = match &cli.config {
        Some(path) => ChannelConfig::load(path),
        None => Ok(ChannelConfig::default().with_env_overrides()),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(uri) = &cli.uri {
        config = config.with_uri(uri);
    }
    if let Some(key) = &cli.api_key {
        config = config.with_api_key(key);
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    tracing::debug!(uri = %config.uri, "effective configuration loaded");
    config
}

fn read_input(file: &str) -> String {
    let result = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map(|_| buf)
    } else {
        std::fs::read_to_string(file)
    };
    match result {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("Error reading {}: {}", file, e);
            std::process::exit(1);
        }
    }
}

fn validate_file(file: &str, strict: bool) {
    let contents = read_input(file);
    let message = match archlink_channel::decode(contents.trim().as_bytes()) {
        Ok(message) => message,
        Err(e) => {
            println!("invalid: {}", e.message());
            std::process::exit(1);
        }
    };

    let report = Validator::new().with_strict_categories(strict).report(&message);
    if report.valid {
        println!("valid: {}", message.describe());
    } else {
        println!("invalid: {}", report.reason.unwrap_or_default());
        std::process::exit(1);
    }
}

fn build_channel(config: ChannelConfig) -> Channel {
    match Channel::new(config) {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn send_command(config: ChannelConfig, json: &str, timeout: Option<u64>) {
    let command: Message = match archlink_channel::decode(json.as_bytes()) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error parsing command: {}", e.message());
            std::process::exit(1);
        }
    };
    let timeout = timeout.map(Duration::from_secs).unwrap_or_else(|| config.response_timeout());

    let channel = build_channel(config);
    if let Err(e) = channel.connect().await {
        eprintln!("Error connecting: {}", e);
        std::process::exit(1);
    }

    let result = channel.send_command_with_timeout(command, timeout).await;
    channel.disconnect().await;

    match result {
        Ok(reply) => match serde_json::to_string_pretty(&reply) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error printing reply: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn watch(config: ChannelConfig) {
    let channel = build_channel(config);
    let mut events = channel.subscribe();

    if let Err(e) = channel.connect().await {
        eprintln!("Not connected yet ({}); retrying in the background", e);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => eprintln!("... {} events missed", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    channel.disconnect().await;
}

fn print_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::StateChanged { from, to } => eprintln!("[state] {} -> {}", from, to),
        ChannelEvent::Unsolicited(message) => match serde_json::to_string(message) {
            Ok(line) => println!("{}", line),
            Err(_) => println!("{}", message.describe()),
        },
        ChannelEvent::DeliveryFailed { correlation_id, attempts } => {
            eprintln!("[delivery failed] {} after {} attempts", correlation_id, attempts)
        }
        ChannelEvent::ApprovalRequired(action) => {
            eprintln!("[approval required] {}", action.kind)
        }
        ChannelEvent::Rejected { reason } => eprintln!("[rejected] {}", reason),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Validate { file, strict } => validate_file(file, *strict),
        Commands::Send { json, timeout } => {
            let config = load_config(&cli);
            send_command(config, json, *timeout).await;
        }
        Commands::Watch => watch(load_config(&cli)).await,
        Commands::Config => {
            let config = load_config(&cli);
            match config.to_toml_string() {
                Ok(text) => print!("{}", text),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
