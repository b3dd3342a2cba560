//! Command-line interface parsing and handling
//!
//! This module parses arguments, initializes logging and dispatches to the
//! subcommands that drive a [`Fleet`].

use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::core::config::defaults::DEFAULT_ENV_FILE_NAME;
use crate::core::config::io::default_config_path;
use crate::core::config::ConfigSnapshot;
use crate::core::fleet::{Fleet, FleetOptions};
use crate::mcp::CapabilityMode;
use crate::supervisor::{ServerStatus, SupervisorEvent};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_DESCRIBE").unwrap_or("unknown"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"),
    )
});

#[derive(Parser, Debug)]
#[command(name = "mcp-fleet")]
#[command(version, long_version = LONG_VERSION.as_str())]
#[command(about = "Keep a fleet of MCP tool servers running")]
#[command(
    long_about = "mcp-fleet starts every server listed in a configuration file, restarts the ones \
that crash, and applies edits to the file without disturbing servers that did not change.\n\n\
Configuration:\n\
  mcp-fleet.toml    Server definitions and supervisor settings (TOML or JSON)\n\
  .env              Optional variables for ${VAR} placeholders and child environments\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter (defaults to mcp_fleet=info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server configuration file
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Environment file (defaults to .env beside the configuration file)
    #[arg(short = 'e', long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Run servers without the MCP handshake or tool discovery
    #[arg(long, global = true)]
    pub no_capabilities: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start all servers and supervise them until interrupted (default)
    Run,
    /// Validate the configuration and list the servers it defines
    Check,
    /// Start all servers, print their status and exit
    Status {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Invoke a tool on a server and print the result
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        arguments: Option<String>,
    },
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    pub fn env_path(&self) -> PathBuf {
        self.env_file
            .clone()
            .unwrap_or_else(|| env_file_beside(&self.config_path()))
    }

    pub fn fleet_options(&self, watch: bool) -> FleetOptions {
        FleetOptions {
            config_path: self.config_path(),
            env_path: Some(self.env_path()),
            capability_mode: self.no_capabilities.then_some(CapabilityMode::PassThrough),
            watch,
        }
    }
}

fn env_file_beside(config: &Path) -> PathBuf {
    match config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(DEFAULT_ENV_FILE_NAME),
        _ => PathBuf::from(DEFAULT_ENV_FILE_NAME),
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_fleet=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run(&args).await,
        Commands::Check => check(&args),
        Commands::Status { json } => status(&args, json).await,
        Commands::Call {
            server,
            tool,
            arguments,
        } => call(&args, &server, &tool, arguments.as_deref()).await,
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let fleet = Fleet::initialize(args.fleet_options(true)).await?;
    let mut events = fleet.subscribe();
    info!(summary = %fleet.facade().summary(), "Fleet running; press Ctrl+C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "Unable to listen for Ctrl+C; shutting down");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed supervisor events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    fleet.shutdown().await;
    Ok(())
}

fn log_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::StatusChanged { name, from, to } => {
            info!(server = %name, from = %from, to = %to, "Status changed");
        }
        SupervisorEvent::Restarting { name, attempt } => {
            info!(server = %name, attempt, "Restarting");
        }
        SupervisorEvent::Removed { name } => info!(server = %name, "Removed"),
    }
}

fn check(args: &Args) -> Result<(), Box<dyn Error>> {
    let config_path = args.config_path();
    let env_path = args.env_path();
    let snapshot = match ConfigSnapshot::load(&config_path, Some(&env_path)) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    println!("✅ {} is valid", config_path.display());
    for spec in snapshot.servers.values() {
        let state = if spec.is_enabled() { "enabled" } else { "disabled" };
        let auto_restart = if spec.auto_restart_enabled(&snapshot.settings) {
            "auto-restart"
        } else {
            "no restart"
        };
        println!(
            "  {:<20} {:<9} {:<13} {}",
            spec.name,
            state,
            auto_restart,
            command_line(&spec.command, &spec.args)
        );
    }
    for warning in &snapshot.warnings {
        println!("⚠️  {warning}");
    }
    Ok(())
}

async fn status(args: &Args, json: bool) -> Result<(), Box<dyn Error>> {
    let fleet = Fleet::initialize(args.fleet_options(false)).await?;
    let statuses = fleet.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        print_status_table(&statuses);
        println!("{}", fleet.facade().summary());
    }
    fleet.shutdown().await;
    Ok(())
}

async fn call(
    args: &Args,
    server: &str,
    tool: &str,
    arguments: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let arguments = parse_arguments(arguments)?;
    let fleet = Fleet::initialize(args.fleet_options(false)).await?;
    let result = fleet.call_tool(server, tool, arguments).await;
    fleet.shutdown().await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    }
}

/// Parses the optional JSON argument of `call`. Absent means no arguments.
pub fn parse_arguments(raw: Option<&str>) -> Result<Map<String, Value>, Box<dyn Error>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("Tool arguments must be a JSON object, got: {other}").into()),
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_status_table(statuses: &[ServerStatus]) {
    println!(
        "{:<20} {:<9} {:>8} {:>10} {:>8}  TOOLS",
        "NAME", "STATUS", "PID", "UPTIME", "RESTARTS"
    );
    for status in statuses {
        let pid = status
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = status
            .uptime_secs
            .map(format_uptime)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<9} {:>8} {:>10} {:>8}  {}",
            status.name,
            status.status,
            pid,
            uptime,
            status.restart_count,
            status.tools.len()
        );
        if let Some(error) = &status.last_error {
            println!("  ↳ {error}");
        }
    }
}

pub fn format_uptime(secs: u64) -> String {
    let (hours, rest) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
